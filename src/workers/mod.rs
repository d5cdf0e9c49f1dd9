pub mod heartbeat;
pub mod stats_publisher;
