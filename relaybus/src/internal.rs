mod dispatcher;
mod queue_worker;

pub(crate) use dispatcher::{Dispatcher, Settlement};
pub(crate) use queue_worker::QueueWorker;
