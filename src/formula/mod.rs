pub mod node;
pub mod hash;
pub mod translate;
pub mod resolve;
pub mod facet;
