use crate::seq_nr::Seqno;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Text(&'static str),

    #[error("send window full: {in_flight} packets in flight")]
    WindowFull { in_flight: usize },

    #[error("session closed")]
    SessionClosed,

    #[error("error sending packet {seq_nr}, it stays scheduled for retransmission: {source}")]
    InitialSendFailed {
        seq_nr: Seqno,
        #[source]
        source: std::io::Error,
    },

    #[error("error sending packet: {0}")]
    Send(std::io::Error),

    #[error("already listening on inbox {0:?}")]
    AlreadyListening(String),

    #[error("network subscription closed")]
    SubscriptionClosed,

    #[error("fatal transport error: {0}")]
    FatalTransport(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("error loading TLS material: {0}")]
    Tls(String),

    #[error("error connecting: {0}")]
    Connect(String),

    #[error("bug: retry queue index desync for {seq_nr}: map says {mapped}, heap len {len}")]
    BugHeapIndexDesync {
        seq_nr: Seqno,
        mapped: usize,
        len: usize,
    },

    #[error("bug: retry deadline overflowed")]
    BugDeadlineOverflow,
}

impl Error {
    /// An internal invariant was violated.
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            Error::BugHeapIndexDesync { .. } | Error::BugDeadlineOverflow
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) trait OptionContext<T>: Sized {
    fn context(self, msg: &'static str) -> Result<T>;
}

impl<T> OptionContext<T> for Option<T> {
    fn context(self, msg: &'static str) -> Result<T> {
        self.ok_or(Error::Text(msg))
    }
}
