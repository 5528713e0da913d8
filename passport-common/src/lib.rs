pub mod event;
pub mod metrics;
pub mod passport;
pub mod record;
pub mod retry;
pub mod store;
pub mod time;
