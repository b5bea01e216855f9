//! Typestate APIs generated at build time from `../protocols`.
//!
//! `purchase` wires Buyer, Seller and Shipper together behind `connect()`.
//! `negotiate` is a single role. `rounds` nests one rec inside another.

include!(concat!(env!("OUT_DIR"), "/purchase.rs"));
include!(concat!(env!("OUT_DIR"), "/negotiate.rs"));
include!(concat!(env!("OUT_DIR"), "/rounds.rs"));
