//! # ev3link-monitor: Headless Brick Monitor
//!
//! Connects to EV3 bricks over TCP, keeps one command scheduler per
//! brick and supervises the links with the connection health poller.
//! Bricks that drop off the network are re-dialed automatically; bricks
//! disconnected on request are left alone.
//!
//! Status changes are logged, or printed as JSON lines with
//! `--snapshot-json`.

pub mod config;
pub mod monitor;
