pub mod producer;
pub mod context;
pub mod bitmap;
pub mod flag;
pub mod map;
