// Order side: expiry reconciliation and the tasks that drive it

pub mod expiry;
pub mod listener;
pub mod order_store;
