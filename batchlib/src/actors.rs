pub(crate) mod coordinator;
pub(crate) mod poller;
pub(crate) mod worker;
