pub mod download;
pub mod http;
pub mod logging;
pub mod supervisor;
pub mod telegram;
pub mod timing;
