pub mod products;
pub mod seed;
pub mod status;
pub mod wat;
pub mod yields;
