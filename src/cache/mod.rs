pub mod payload;
pub mod formula_cache;
