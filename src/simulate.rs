//! Simulated agents for `codeflow run`.
//!
//! Agents report through the same inbound path a real agent would use, so a
//! simulated run exercises assignment, status reporting and event delivery
//! end to end.

use std::collections::BTreeSet;

use rand::Rng;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use codeflow_core::event::Notification;
use codeflow_core::types::{
    Agent, AgentSpec, AgentStatus, AgentType, RunContext, RunId, RunStatus, Task, TaskFilter,
    TaskStatus, WorkflowSpec, WorkflowStatus,
};
use codeflow_engine::{Engine, InboundMessage, InboundRouter};

pub async fn run(
    engine: &Engine,
    spec: WorkflowSpec,
    agents: usize,
    context: RunContext,
    fail_rate: f64,
) -> anyhow::Result<()> {
    if agents == 0 {
        anyhow::bail!("at least one simulated agent is needed");
    }
    let mut events = engine.outbound().bus().subscribe();
    let router = InboundRouter::new(engine.clone());

    let capabilities: BTreeSet<String> = spec
        .graph
        .nodes()
        .iter()
        .filter_map(|n| n.template())
        .flat_map(|t| t.required_capabilities.iter().cloned())
        .collect();
    let mut pool = Vec::with_capacity(agents);
    for i in 0..agents {
        let agent = engine
            .agents()
            .register(
                AgentSpec::new(format!("sim-{i}"))
                    .with_type(AgentType::Custom)
                    .with_capabilities(capabilities.iter().cloned()),
            )
            .await?;
        router
            .handle(InboundMessage::Status {
                agent_id: agent.id.clone(),
                status: AgentStatus::Online,
            })
            .await?;
        pool.push(agent);
    }
    info!(agents = pool.len(), "Simulated agents online");

    let (workflow, validation) = engine.workflows().create(spec).await?;
    if !validation.is_valid() {
        for error in &validation.errors {
            eprintln!("  - {error}");
        }
        anyhow::bail!("workflow {} is malformed", workflow.name);
    }
    engine
        .workflows()
        .set_status(&workflow.id, WorkflowStatus::Active)
        .await?;

    let run = engine.submit_run(&workflow.id, context).await?;
    println!("Run {} of {}", run.id, workflow.name);
    print_events(&mut events);

    let run = drive(engine, &router, &pool, &run.id, fail_rate, &mut events).await?;

    let trace = engine.trace(&run.id).await?;
    let path: Vec<&str> = trace.iter().map(|n| n.as_str()).collect();
    println!();
    println!("Path: {}", path.join(" -> "));
    println!("Status: {}", run.status);

    match run.status {
        RunStatus::Completed => Ok(()),
        _ => anyhow::bail!(
            "run {} ended {}: {}",
            run.id,
            run.status,
            run.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

/// Step every task of the run forward until the run is terminal.
async fn drive(
    engine: &Engine,
    router: &InboundRouter,
    pool: &[Agent],
    run_id: &RunId,
    fail_rate: f64,
    events: &mut broadcast::Receiver<Notification>,
) -> anyhow::Result<codeflow_core::types::WorkflowRun> {
    loop {
        let run = engine.get_run(run_id).await?;
        if run.status.is_terminal() {
            print_events(events);
            return Ok(run);
        }

        let tasks = engine
            .tasks()
            .list(&TaskFilter {
                run_id: Some(run_id.clone()),
                ..Default::default()
            })
            .await?;

        let mut progressed = false;
        for task in &tasks {
            let next = match task.status {
                TaskStatus::Assigned => TaskStatus::Running,
                TaskStatus::Running if should_fail(fail_rate) => TaskStatus::Failed,
                TaskStatus::Running => TaskStatus::Completed,
                _ => continue,
            };
            // An earlier report in this pass may have ended the run.
            if engine.get_run(run_id).await?.status.is_terminal() {
                break;
            }
            report(router, task, next).await?;
            progressed = true;
        }
        if !progressed {
            progressed = assign_waiting(engine, pool, &tasks).await?;
        }
        print_events(events);

        if !progressed {
            anyhow::bail!("run {run_id} is stuck: no task can be handed to a simulated agent");
        }
    }
}

async fn report(router: &InboundRouter, task: &Task, status: TaskStatus) -> anyhow::Result<()> {
    let Some(agent_id) = task.assigned_agent_id.clone() else {
        return Ok(());
    };
    let (output, error) = match status {
        TaskStatus::Completed => (Some(format!("{} done", task.title)), None),
        TaskStatus::Failed => (None, Some("simulated failure".to_string())),
        _ => (None, None),
    };
    debug!(task_id = %task.id, status = %status, "Simulated report");
    router
        .handle(InboundMessage::TaskUpdate {
            agent_id,
            task_id: task.id.clone(),
            status,
            output,
            error,
        })
        .await?;
    Ok(())
}

/// Hand queued tasks the assignment policy left alone (manual tasks naming
/// no known agent) to an idle simulated agent.
async fn assign_waiting(engine: &Engine, pool: &[Agent], tasks: &[Task]) -> anyhow::Result<bool> {
    if engine.dispatch_pending().await? > 0 {
        return Ok(true);
    }
    let mut assigned = false;
    for task in tasks.iter().filter(|t| t.status == TaskStatus::Queued) {
        for agent in pool {
            if !engine.agents().get(&agent.id).await?.is_available() {
                continue;
            }
            match engine.assign_task(&task.id, &agent.id).await {
                Ok(_) => {
                    assigned = true;
                    break;
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "Manual assignment failed"),
            }
        }
    }
    Ok(assigned)
}

fn should_fail(rate: f64) -> bool {
    rate > 0.0 && rand::thread_rng().gen_bool(rate)
}

fn print_events(rx: &mut broadcast::Receiver<Notification>) {
    loop {
        match rx.try_recv() {
            Ok(event) => println!(
                "{:<20} {:<40} {}",
                event.event_type.as_str(),
                event.entity_id,
                event.new_state
            ),
            Err(TryRecvError::Lagged(missed)) => {
                warn!(missed, "Event printer fell behind");
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
}
