// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// - config:     Configuration document (JSON) and validation
// - error:      Error taxonomy shared by every layer
// - schema:     Record shapes, payloads and the ApiResult envelope
// - normalizer: Raw JSON → typed records
// - channels:   Channel descriptors and dynamic discovery
// - context:    Per-service and per-message contexts
// - transport:  HTTP client used by facades
// - exchanges:  Exchange facades and facade registry
// - adapters:   Poll and stream runtimes driving the facades
// - pipeline:   Strategy chain and the serializing dispatcher
// - strategies: Built-in strategies
// - app:        Wiring of all of the above
// - metrics:    Runtime counters
// - util:       Small shared helpers
//
pub mod adapters;
pub mod app;
pub mod channels;
pub mod config;
pub mod context;
pub mod error;
pub mod exchanges;
pub mod metrics;
pub mod normalizer;
pub mod pipeline;
pub mod schema;
pub mod strategies;
pub mod transport;
pub mod util;

pub use app::App;
pub use config::Config;
pub use metrics::RuntimeMetrics;
