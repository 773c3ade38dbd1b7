pub mod bar_cache;
pub mod kline_stream;
pub mod supervisor;

pub use bar_cache::{BarCache, Candle, CandleKey};
pub use kline_stream::{run_kline_stream, ClosedBar};
pub use supervisor::KlineStreamSupervisor;
