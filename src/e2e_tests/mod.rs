use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    DefaultSwpEnvironment, Error, NetEvent, PacketState, Session, SessionOpts, SimNet, SimNetOpts,
    seq_nr::Seqno, test_util::setup_test_logging,
};

const TIMEOUT: Duration = Duration::from_secs(600);

async fn start(net: &SimNet, inbox: &str, remote: &str, max_window: usize) -> Session {
    Session::start(
        net.clone(),
        DefaultSwpEnvironment::default(),
        SessionOpts {
            max_window: Some(max_window),
            ..SessionOpts::new(inbox, remote)
        },
    )
    .await
    .unwrap()
}

async fn recv_n(session: &mut Session, n: usize) -> Vec<Vec<u8>> {
    let mut got = Vec::with_capacity(n);
    while got.len() < n {
        got.push(session.recv().await.unwrap());
    }
    got
}

fn payloads(n: u32) -> Vec<Vec<u8>> {
    (0..n).map(|i| i.to_be_bytes().to_vec()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_single_loss_single_retransmission() {
    setup_test_logging();
    let net = SimNet::new();
    let a = start(&net, "a", "b", 10).await;
    let mut b = start(&net, "b", "a", 10).await;

    net.drop_next(|p| p.header.is_data() && p.seq_nr() == Seqno(3));
    for (i, payload) in payloads(10).into_iter().enumerate() {
        assert_eq!(a.submit(payload).await.unwrap(), Seqno(i as u64));
    }

    let stats = timeout(TIMEOUT, a.wait_all_acked()).await.unwrap().unwrap();
    assert_eq!(stats.submitted, 10);
    assert_eq!(stats.retransmissions, 1);
    assert_eq!(net.data_sends("b", Seqno(3)), 2);
    for seq in (0..10).filter(|s| *s != 3) {
        assert_eq!(net.data_sends("b", Seqno(seq)), 1, "seq {seq}");
    }

    assert_eq!(
        a.state_of(Seqno(3)).await.unwrap(),
        Some(PacketState::Acknowledged)
    );
    assert_eq!(a.state_of(Seqno(10)).await.unwrap(), None);

    assert_eq!(recv_n(&mut b, 10).await, payloads(10));
}

#[tokio::test(start_paused = true)]
async fn test_lossy_duplicating_bidirectional() {
    setup_test_logging();
    let net = SimNet::with_opts(SimNetOpts {
        loss_pct: 20.,
        dup_pct: 10.,
        delay: Some(Duration::from_millis(3)),
    });
    let mut a = start(&net, "a", "b", 16).await;
    let mut b = start(&net, "b", "a", 16).await;

    const N: u32 = 200;
    let run = async {
        let send_a = async {
            for p in payloads(N) {
                a.submit(p).await.unwrap();
            }
            a.wait_all_acked().await.unwrap()
        };
        let send_b = async {
            for p in payloads(N) {
                b.submit(p).await.unwrap();
            }
            b.wait_all_acked().await.unwrap()
        };
        tokio::join!(send_a, send_b)
    };
    let (stats_a, stats_b) = timeout(TIMEOUT, run).await.unwrap();
    info!(?stats_a, ?stats_b, net = ?net.stats(), "done");
    assert_eq!(stats_a.acked, N as u64);
    assert_eq!(stats_b.acked, N as u64);

    assert_eq!(recv_n(&mut a, N as usize).await, payloads(N));
    assert_eq!(recv_n(&mut b, N as usize).await, payloads(N));
}

#[tokio::test(start_paused = true)]
async fn test_window_full_until_peer_shows_up() {
    setup_test_logging();
    let net = SimNet::new();
    let a = start(&net, "a", "b", 2).await;

    // The peer's window is unknown until it answers, so only one goes out.
    a.try_submit(b"0".to_vec()).await.unwrap();
    assert!(matches!(
        a.try_submit(b"1".to_vec()).await,
        Err(Error::WindowFull { in_flight: 1 })
    ));

    // Nobody listens yet: everything sent so far is lost and retried.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(a.stats().retransmissions > 0);

    let mut b = start(&net, "b", "a", 2).await;
    for (i, payload) in [b"1", b"2"].into_iter().enumerate() {
        let seq = timeout(TIMEOUT, a.submit(payload.to_vec()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seq, Seqno(i as u64 + 1));
    }
    timeout(TIMEOUT, a.wait_all_acked()).await.unwrap().unwrap();
    assert_eq!(
        recv_n(&mut b, 3).await,
        vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_sender_respects_smaller_peer_window() {
    setup_test_logging();
    let net = SimNet::new();
    let a = start(&net, "a", "b", 16).await;
    let mut b = start(&net, "b", "a", 2).await;

    net.drop_next(|p| p.header.is_data() && p.seq_nr() == Seqno(0));
    for payload in payloads(16) {
        timeout(TIMEOUT, a.submit(payload)).await.unwrap().unwrap();
    }
    let stats = timeout(TIMEOUT, a.wait_all_acked()).await.unwrap().unwrap();

    // Nothing was sent past what b could buffer, so only the lost one was resent.
    assert_eq!(stats.retransmissions, 1);
    assert_eq!(net.data_sends("b", Seqno(0)), 2);
    for seq in 1..16 {
        assert_eq!(net.data_sends("b", Seqno(seq)), 1, "seq {seq}");
    }
    let acks: Vec<_> = net
        .sent_log()
        .into_iter()
        .filter(|r| r.header.is_ack() && r.dest == "a")
        .collect();
    assert!(!acks.is_empty());
    assert!(acks.iter().all(|r| r.header.wnd == 2));
    assert_eq!(recv_n(&mut b, 16).await, payloads(16));
}

#[tokio::test(start_paused = true)]
async fn test_earlier_deadline_interrupts_timer() {
    setup_test_logging();
    let net = SimNet::new();
    let opts = |inbox: &str, remote: &str| SessionOpts {
        max_window: Some(4),
        min_rto: Some(Duration::from_millis(100)),
        ..SessionOpts::new(inbox, remote)
    };
    let env = DefaultSwpEnvironment::default();
    let a = Session::start(net.clone(), env, opts("a", "b"))
        .await
        .unwrap();
    let mut b = Session::start(net.clone(), env, opts("b", "a"))
        .await
        .unwrap();

    a.submit(b"0".to_vec()).await.unwrap();
    timeout(TIMEOUT, a.wait_all_acked()).await.unwrap().unwrap();

    // Sent at 0, 100, 300, 700 and 1500ms, all lost. The next try is at 3100ms.
    for _ in 0..5 {
        net.drop_next(|p| p.header.is_data() && p.seq_nr() == Seqno(1));
    }
    a.submit(b"1".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert_eq!(net.data_sends("b", Seqno(1)), 5);

    // The loop sleeps until seq 1 is due, seq 2 must not wait for that.
    net.drop_next(|p| p.header.is_data() && p.seq_nr() == Seqno(2));
    assert_eq!(a.submit(b"2".to_vec()).await.unwrap(), Seqno(2));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(net.data_sends("b", Seqno(2)), 2);
    assert_eq!(net.data_sends("b", Seqno(1)), 5);

    timeout(TIMEOUT, a.wait_all_acked()).await.unwrap().unwrap();
    assert_eq!(net.data_sends("b", Seqno(1)), 6);
    assert_eq!(
        recv_n(&mut b, 3).await,
        vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_retransmissions() {
    setup_test_logging();
    let net = SimNet::new();
    let a = start(&net, "a", "b", 4).await;
    a.submit(b"x".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    a.shutdown();
    assert!(matches!(
        a.wait_until(|_| false).await,
        Err(Error::SessionClosed)
    ));
    let sent = net.stats().sent;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(net.stats().sent, sent);
    assert!(matches!(
        a.submit(b"y".to_vec()).await,
        Err(Error::SessionClosed)
    ));
    assert!(a.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_closed_subscription_ends_session() {
    setup_test_logging();
    let net = SimNet::new();
    let a = start(&net, "a", "b", 4).await;
    assert!(net.close_inbox("a"));
    assert!(matches!(
        timeout(TIMEOUT, a.wait_until(|_| false)).await.unwrap(),
        Err(Error::SessionClosed)
    ));
    assert!(matches!(
        a.try_submit(b"x".to_vec()).await,
        Err(Error::SessionClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_fatal_transport_error_ends_session() {
    setup_test_logging();
    let net = SimNet::new();
    let mut a = start(&net, "a", "b", 4).await;

    net.inject_event(NetEvent::Disconnected);
    net.inject_event(NetEvent::AsyncError {
        error: "slow consumer".into(),
        fatal: false,
    });
    net.inject_event(NetEvent::AsyncError {
        error: "authorization violation".into(),
        fatal: true,
    });

    assert_eq!(a.next_event().await, Some(NetEvent::Disconnected));
    assert!(matches!(
        a.next_event().await,
        Some(NetEvent::AsyncError { fatal: false, .. })
    ));
    assert!(matches!(
        a.next_event().await,
        Some(NetEvent::AsyncError { fatal: true, .. })
    ));
    assert_eq!(a.next_event().await, None);
    assert!(matches!(
        a.submit(b"x".to_vec()).await,
        Err(Error::SessionClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_token() {
    setup_test_logging();
    let net = SimNet::new();
    let token = CancellationToken::new();
    let a = Session::start(
        net.clone(),
        DefaultSwpEnvironment::default(),
        SessionOpts {
            cancellation_token: token.clone(),
            ..SessionOpts::new("a", "b")
        },
    )
    .await
    .unwrap();
    token.cancel();
    assert!(matches!(
        timeout(TIMEOUT, a.wait_until(|_| false)).await.unwrap(),
        Err(Error::SessionClosed)
    ));
}

#[tokio::test]
async fn test_invalid_options() {
    let net = SimNet::new();
    for opts in [
        SessionOpts::new("", "b"),
        SessionOpts {
            max_window: Some(0),
            ..SessionOpts::new("a", "b")
        },
        SessionOpts {
            rtt_alpha: Some(1.5),
            ..SessionOpts::new("a", "b")
        },
        SessionOpts {
            min_rto: Some(Duration::from_secs(2)),
            max_rto: Some(Duration::from_secs(1)),
            ..SessionOpts::new("a", "b")
        },
    ] {
        assert!(matches!(
            Session::start(net.clone(), DefaultSwpEnvironment::default(), opts).await,
            Err(Error::InvalidConfig(_))
        ));
    }

    let _a = Session::start(
        net.clone(),
        DefaultSwpEnvironment::default(),
        SessionOpts::new("a", "b"),
    )
    .await
    .unwrap();
    assert!(matches!(
        Session::start(
            net.clone(),
            DefaultSwpEnvironment::default(),
            SessionOpts::new("a", "c")
        )
        .await,
        Err(Error::AlreadyListening(_))
    ));
}
