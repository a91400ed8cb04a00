// Adapters layer: concrete implementations of the domain ports (http backend, key-value stores).

pub mod http;
pub mod store;
