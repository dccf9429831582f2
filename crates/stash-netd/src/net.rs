pub mod port_pool;
pub mod tunnel;
