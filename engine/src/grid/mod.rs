//! Grid geometry: site → well → plate → global pixel offsets

pub mod layout;
pub mod offsets;

pub use layout::GridLayout;
