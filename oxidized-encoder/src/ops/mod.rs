//! Tensor operations that are not provided by candle.

pub mod loss;
