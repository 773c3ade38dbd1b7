// =============================================================================
// Binance USDⓈ-M futures integration
// =============================================================================
//
// `raw` is the low-level, untested-by-spec wire adapter (spec.md §1's "low
// level exchange REST/WebSocket SDK" collaborator). `retry`, `filters`, and
// `adapter` build the in-scope exchange adapter (spec.md §4.3) on top of it.
// `user_stream` is the user-data stream (spec.md §4.5 item 2).

pub mod adapter;
pub mod filters;
pub mod raw;
pub mod retry;
pub mod user_stream;

pub use adapter::ExchangeAdapter;
pub use raw::RawExchange;
