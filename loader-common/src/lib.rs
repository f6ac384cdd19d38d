pub mod cipher;
pub mod domain;
pub mod keyservice;
pub mod metrics;
pub mod retry;
