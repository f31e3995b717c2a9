pub mod admin;
pub mod hc;
pub mod polls;
pub mod stream;
pub mod votes;
