//! Walk-forward backtesting of a weekly price-direction classifier for
//! collectible trading cards.

pub mod backtest;
pub mod config;
pub mod error;
pub mod evaluate;
pub mod features;
pub mod model;
pub mod models;
pub mod output;
pub mod pipeline;
pub mod source;
pub mod timeline;
