//! Byte transport between the two sides of a relayed connection
//!
//! `pipe` is the half-duplex copy loop; `pair` binds two pipes to one
//! client/upstream connection pair.

pub mod pair;
pub mod pipe;
pub use pair::{ConnectionGauge, ConnectionPair, PairTotals};
pub use pipe::{pipe, Direction, PairHandle, PipeEnd, PipeOutcome};
