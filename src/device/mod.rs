pub mod client;
pub mod history;

pub use client::DeviceClient;
pub use history::{
    decode_page, fetch_history, HistoryPages, HistoryRow, PageSource, RawBucket, RawPage,
};
