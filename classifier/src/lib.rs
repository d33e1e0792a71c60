pub mod classifier;
pub mod hint;
pub mod route_info;
pub mod scanner;
pub mod statement;
pub mod tracker;
pub mod trx_boundary;
pub mod types;
