// src/input.rs
//
// =============================================================================
// LABFLOW: HUMAN-INPUT GATEWAY
// =============================================================================
//
// Some lab steps cannot proceed without a person (load the crucible, confirm
// the door is shut). A task posts a prompt with a finite option set and blocks
// until an operator answers through the CLI, or until the task itself is
// cancelled. Resolution is single-shot: whichever of answer/cancel lands first
// wins, the loser is rejected.

use crate::core::{InputRequest, RequestContext, RequestStatus};
use crate::errors::{LabError, Result};
use crate::store::LabStore;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
pub struct InputGateway {
    store: LabStore,
    poll_interval: Duration,
}

impl InputGateway {
    pub fn new(store: LabStore) -> Self {
        Self {
            store,
            poll_interval: Duration::from_millis(500),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Post a request and block until an operator picks an option or `cancel`
    /// is set. On cancellation the pending request is closed as CANCELLED so
    /// it disappears from the operator queue.
    pub async fn ask(
        &self,
        prompt: impl Into<String>,
        options: Vec<String>,
        context: RequestContext,
        cancel: &AtomicBool,
    ) -> Result<String> {
        if options.is_empty() {
            return Err(LabError::validation(
                "an input request needs at least one option",
            ));
        }
        let request = InputRequest {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            options,
            context,
            status: RequestStatus::Pending,
            response: None,
            note: String::new(),
            last_updated: Utc::now(),
        };
        self.store.insert_request(&request)?;
        log::info!("operator input requested ({}): {}", request.id, request.prompt);

        loop {
            if cancel.load(Ordering::SeqCst) {
                // losing this race means an answer arrived first; honor it
                if self
                    .store
                    .cas_request_resolution(
                        request.id,
                        RequestStatus::Cancelled,
                        None,
                        "requesting task was cancelled",
                    )?
                {
                    return Err(LabError::Cancelled);
                }
            }
            let current = self.store.get_request(request.id)?;
            match current.status {
                RequestStatus::Pending => {}
                RequestStatus::Fulfilled => {
                    let response = current.response.ok_or_else(|| {
                        LabError::InvalidTransition(format!(
                            "request {} fulfilled without a response",
                            request.id
                        ))
                    })?;
                    log::info!("operator answered {}: {response}", request.id);
                    return Ok(response);
                }
                RequestStatus::Cancelled => return Err(LabError::Cancelled),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Operator side: answer a pending request. The response must be one of
    /// the request's options, and only the first answer is accepted.
    pub fn submit_response(&self, id: Uuid, response: &str) -> Result<()> {
        let request = self.store.get_request(id)?;
        if !request.options.iter().any(|o| o == response) {
            return Err(LabError::validation(format!(
                "`{response}` is not an option of request {id} (options: {})",
                request.options.join(", ")
            )));
        }
        if !self
            .store
            .cas_request_resolution(id, RequestStatus::Fulfilled, Some(response), "")?
        {
            return Err(LabError::InvalidTransition(format!(
                "input request {id} is already resolved"
            )));
        }
        Ok(())
    }

    pub fn pending(&self) -> Result<Vec<InputRequest>> {
        self.store.pending_requests()
    }

    /// Close every pending request of a task, used by the supervisor after a
    /// forced termination in case the kill landed between poll cycles.
    pub fn cancel_for_task(&self, task_id: Uuid) -> Result<()> {
        for request in self.store.pending_requests()? {
            if matches!(request.context, RequestContext::Task { task_id: t, .. } if t == task_id) {
                self.store.cas_request_resolution(
                    request.id,
                    RequestStatus::Cancelled,
                    None,
                    "requesting task was terminated",
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> (tempfile::TempDir, LabStore, InputGateway) {
        let dir = tempfile::tempdir().unwrap();
        let store = LabStore::open(dir.path().join("lab.db")).unwrap();
        let gateway =
            InputGateway::new(store.clone()).with_poll_interval(Duration::from_millis(5));
        (dir, store, gateway)
    }

    fn task_context() -> RequestContext {
        RequestContext::Task {
            task_id: Uuid::new_v4(),
            experiment_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn ask_unblocks_on_operator_answer() {
        let (_dir, _store, gateway) = gateway();
        let cancel = AtomicBool::new(false);

        let answerer = {
            let gateway = gateway.clone();
            async move {
                loop {
                    let pending = gateway.pending().unwrap();
                    if let Some(request) = pending.first() {
                        gateway.submit_response(request.id, "done").unwrap();
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        };
        let (answer, ()) = tokio::join!(
            gateway.ask(
                "Load the crucible into furnace_1, then confirm.",
                vec!["done".into()],
                task_context(),
                &cancel,
            ),
            answerer
        );
        assert_eq!(answer.unwrap(), "done");
        assert!(gateway.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn answer_outside_option_set_is_rejected() {
        let (_dir, _store, gateway) = gateway();

        let asker = {
            let gateway = gateway.clone();
            let context = task_context();
            tokio::spawn(async move {
                let flag = AtomicBool::new(false);
                gateway
                    .ask("Proceed?", vec!["yes".into(), "no".into()], context, &flag)
                    .await
            })
        };
        // wait for the request to appear
        let request = loop {
            if let Some(r) = gateway.pending().unwrap().into_iter().next() {
                break r;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        assert!(matches!(
            gateway.submit_response(request.id, "maybe"),
            Err(LabError::Validation(_))
        ));
        gateway.submit_response(request.id, "yes").unwrap();
        // second answer hits an already-resolved request
        assert!(matches!(
            gateway.submit_response(request.id, "no"),
            Err(LabError::InvalidTransition(_))
        ));
        assert_eq!(asker.await.unwrap().unwrap(), "yes");
    }

    #[tokio::test]
    async fn cancelled_ask_closes_the_request() {
        let (_dir, store, gateway) = gateway();
        let cancel = AtomicBool::new(false);

        let flagger = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.store(true, Ordering::SeqCst);
        };
        let (result, ()) = tokio::join!(
            gateway.ask("Confirm door shut.", vec!["ok".into()], task_context(), &cancel),
            flagger
        );
        assert!(matches!(result, Err(LabError::Cancelled)));
        assert!(gateway.pending().unwrap().is_empty());

        // the stored request is closed, not deleted
        let conn = store.conn().unwrap();
        let status: String = conn
            .query_row("SELECT status FROM input_requests", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "CANCELLED");
    }
}
