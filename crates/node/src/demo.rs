//! Sample order workflow run by the node binary.

use serde_json::{Map, json};
use tracing::info;

use stepflow_client::{ClientConfig, ClientError, ClientHandle, ExternalTaskClient};
use stepflow_core::ProcessInstanceId;
use stepflow_pvm::{Activity, Behavior, DelegateExecution, EventName, ProcessModel, Transition};

use crate::node::Node;

pub const ORDER_PROCESS: &str = "order-fulfilment";
pub const PAYMENT_TOPIC: &str = "payments";

/// receive → reserve stock (async) → charge (external) → ship or review → end
pub fn order_process() -> anyhow::Result<ProcessModel> {
    let model = ProcessModel::builder(ORDER_PROCESS)
        .name("Order fulfilment")
        .activity(Activity::new("receive", Behavior::Automatic).listener(
            EventName::Start,
            |execution: &mut DelegateExecution<'_>| {
                info!(process_instance_id = %execution.process_instance_id(), "order received");
                Ok(())
            },
        ))
        .activity(
            Activity::new(
                "reserve-stock",
                Behavior::service_task(|execution: &mut DelegateExecution<'_>| {
                    execution.set_variable("reserved", json!(true));
                    Ok(())
                }),
            )
            .async_before(),
        )
        .activity(Activity::new("charge", Behavior::external_task(PAYMENT_TOPIC)))
        .activity(Activity::new("route", Behavior::Automatic))
        .activity(
            Activity::new(
                "ship",
                Behavior::service_task(|execution: &mut DelegateExecution<'_>| {
                    execution.set_variable("shipped", json!(true));
                    Ok(())
                }),
            )
            .async_after(),
        )
        .activity(Activity::new("review", Behavior::WaitState))
        .activity(Activity::new("end", Behavior::EndEvent).listener(
            EventName::End,
            |execution: &mut DelegateExecution<'_>| {
                info!(process_instance_id = %execution.process_instance_id(), "order fulfilled");
                Ok(())
            },
        ))
        .flow("receive", "reserve-stock")
        .flow("reserve-stock", "charge")
        .flow("charge", "route")
        .transition(Transition::new("paid", "route", "ship").when(|vars| {
            vars.get("receipt").is_some_and(|r| !r.is_null())
        }))
        .transition(Transition::new("unpaid", "route", "review"))
        .flow("ship", "end")
        .flow("review", "end")
        .build()?;
    Ok(model)
}

/// Start `count` orders of increasing amount.
pub fn start_orders(node: &Node, count: usize) -> anyhow::Result<Vec<ProcessInstanceId>> {
    (0..count)
        .map(|i| {
            let mut variables = Map::new();
            variables.insert("amount".into(), json!(100 * (i + 1)));
            let id = node.runtime.start_process_instance_by_key(
                ORDER_PROCESS,
                Some(format!("order-{}", i + 1)),
                variables,
            )?;
            Ok(id)
        })
        .collect()
}

/// Worker that charges every order and reports a receipt.
pub fn payment_worker(node: &Node, config: &ClientConfig) -> Result<ClientHandle, ClientError> {
    ExternalTaskClient::new(node.external_tasks.clone(), config.clone())?
        .subscribe(PAYMENT_TOPIC, |task, tasks| {
            let amount = task.variables.get("amount").cloned().unwrap_or(json!(0));
            let mut result = Map::new();
            result.insert("receipt".into(), json!(format!("rcpt-{}", task.id)));
            result.insert("charged".into(), amount);
            tasks.complete(task, result)
        })
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_process_is_valid() {
        let model = order_process().unwrap();
        assert_eq!(model.key(), ORDER_PROCESS);
        assert_eq!(model.initial(), "receive");
        assert_eq!(model.outgoing("route").count(), 2);
    }
}
