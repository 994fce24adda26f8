//! Packet capture and analysis.
//!
//! A [`capture::session::Session`] drives an external capture tool (tshark,
//! tcpdump or dumpcap, first one that works), decodes what it produces into
//! [`analyser::containers::PacketRecord`]s and keeps the most recent ones in
//! a bounded [`store::PacketStore`]. When no tool can capture, the session can
//! fall back to inferring activity from the OS connection table.
pub mod analyser;
pub mod capture;
pub mod config;
pub mod error;
pub mod monitor;
pub mod store;
