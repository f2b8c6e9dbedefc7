use super::messages::{ItemEvent, ItemUpdate, WorkerMessage};
use super::WorkerTask;
use crate::local::ItemContext;

use tokio::{select, sync::mpsc, time};
use tracing::debug;

pub struct Actor {
    inbox: mpsc::UnboundedReceiver<WorkerMessage>,
}

impl Actor {
    pub fn spawn(inbox: mpsc::UnboundedReceiver<WorkerMessage>, task: WorkerTask) {
        let actor = Self { inbox };
        tokio::spawn(async move { actor.run(task).await });
    }

    async fn run(mut self, task: WorkerTask) {
        let job_id = task.job_id.clone();
        let index = task.index;
        let execution = task.execute();
        tokio::pin!(execution);
        select! {
            _ = &mut execution => {}
            // stop requested or handle dropped: the item's future is dropped with us
            _ = self.inbox.recv() => {
                debug!(job_id = %job_id, index, "Worker stopped");
            }
        }
    }
}

impl WorkerTask {
    fn emit(&self, update: ItemUpdate) {
        let _ = self.events.send(ItemEvent {
            job_id: self.job_id.clone(),
            index: self.index,
            update,
        });
    }

    async fn execute(self) {
        let item = match self.spec.item(self.index) {
            Some(item) => item,
            None => {
                self.emit(ItemUpdate::Failed {
                    reason: format!("array index {} has no argument", self.index),
                });
                return;
            }
        };
        let argument = item.argument.clone();
        let resources = *self.spec.resources();

        // simulated provisioning: the item sits in RUNNABLE meanwhile
        time::sleep(self.start_delay).await;

        for attempt in 1..=resources.retries {
            let permit = match self.pool.acquire_many(resources.vcpus).await {
                Ok(permit) => permit,
                // pool closed, the backend is shutting down
                Err(_) => return,
            };
            self.emit(ItemUpdate::Starting);
            self.emit(ItemUpdate::Running);

            let ctx = ItemContext::new(&self.job_id, &item, attempt);
            let outcome = (self.callable)(ctx, argument.clone()).await;
            drop(permit);

            match outcome {
                Ok(payload) => {
                    self.emit(ItemUpdate::Succeeded { payload });
                    return;
                }
                Err(reason) if attempt < resources.retries => {
                    debug!(job_id = %self.job_id, index = self.index, attempt, %reason, "Attempt failed, retrying");
                    self.emit(ItemUpdate::Retrying { reason });
                }
                Err(reason) => {
                    self.emit(ItemUpdate::Failed { reason });
                    return;
                }
            }
        }
    }
}
