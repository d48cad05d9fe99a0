use lazy_static::lazy_static;
use metrics::{Counter, Gauge, Histogram, counter, gauge, histogram};

pub struct Metrics {
    pub acks_received: Counter,
    pub delivered: Counter,
    pub duplicate_acks: Counter,
    pub duplicate_packets: Counter,
    pub live_sessions: Gauge,
    pub out_of_order_packets: Counter,
    pub out_of_window_packets: Counter,
    pub retransmissions: Counter,
    pub rtt: Histogram,
    pub send_errors: Counter,
    pub submitted: Counter,
    pub transport_events: Counter,
    pub window_full: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            acks_received: counter!("swp_acks_received"),
            delivered: counter!("swp_delivered"),
            duplicate_acks: counter!("swp_duplicate_acks"),
            duplicate_packets: counter!("swp_duplicate_packets"),
            live_sessions: gauge!("swp_live_sessions"),
            out_of_order_packets: counter!("swp_out_of_order_packets"),
            out_of_window_packets: counter!("swp_out_of_window_packets"),
            retransmissions: counter!("swp_retransmissions"),
            rtt: histogram!("swp_rtt"),
            send_errors: counter!("swp_send_errors"),
            submitted: counter!("swp_submitted"),
            transport_events: counter!("swp_transport_events"),
            window_full: counter!("swp_window_full"),
        }
    }
}

lazy_static! {
    pub static ref METRICS: Metrics = Metrics::new();
}
