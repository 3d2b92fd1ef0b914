pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod fetch;
pub mod model;
pub mod output;
pub mod poller;
pub mod publisher;
pub mod stats;
pub mod store;
pub mod stream;
pub mod wire;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
