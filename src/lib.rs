//! vmperf - periodic resource metrics for libvirt domains and LXC containers.
//!
//! Each cycle lists the running entities of one backend, reads their CPU,
//! memory, network and block statistics, and emits flat metric records.

pub mod assemble;
pub mod backend;
pub mod config;
pub mod container;
pub mod cycle;
pub mod enumerate;
pub mod error;
pub mod filter;
pub mod hypervisor;
pub mod metrics;
pub mod sink;
