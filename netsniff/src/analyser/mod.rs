//! Frame decoding and protocol analysis.
//! Decode headers, classify the payload, and lift credentials out of plaintext traffic.
pub mod containers;
pub mod credentials;
pub mod decrypt;
pub mod frame;
pub mod pipeline;
pub mod protocol;
