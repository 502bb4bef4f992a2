//! Admin command parser (colon-delimited text protocol).
//!
//! ```text
//! start:<TaskId>:<Node1>:<restart|relocate|remove>[:<Node2>:<type>...]
//! finish:<TaskId>
//! SignalReady:<jobId>:<ud>
//! SignalError:<jobId>:<ud>:<description>
//! ProcessCurrentNotification
//! UpdateJobBlockingPolicy:<policy>
//! BreakpointContinue:<name>
//! GetCurrentState
//! GetJobBlockingPolicy
//! ```
//!
//! Command names are case-insensitive. Anything that fails to parse is
//! rejected before it reaches the coordinator.

use super::errors::CoordinatorError;
use super::ids::TaskId;
use super::policy::JobBlockingPolicy;
use super::task::{NodeTask, NodeTaskDescription};

pub const UNRECOGNIZED_COMMAND: &str = "Unrecognized command name";

/// Start/Finish request for an arbitrary task id, issued by an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCommand {
    Start {
        task_id: TaskId,
        node_tasks: Vec<NodeTaskDescription>,
    },
    Finish {
        task_id: TaskId,
    },
}

impl TaskCommand {
    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskCommand::Start { task_id, .. } | TaskCommand::Finish { task_id } => task_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorCommand {
    Task(TaskCommand),
    SignalReady {
        job_id: String,
        ud: i32,
    },
    SignalError {
        job_id: String,
        ud: i32,
        description: String,
    },
    ProcessCurrentNotification,
    UpdateJobBlockingPolicy(JobBlockingPolicy),
    BreakpointContinue(String),
    GetCurrentState,
    GetJobBlockingPolicy,
}

impl CoordinatorCommand {
    /// Admin commands change state; user commands only read it.
    pub fn is_admin(&self) -> bool {
        !matches!(
            self,
            CoordinatorCommand::GetCurrentState | CoordinatorCommand::GetJobBlockingPolicy
        )
    }

    pub fn parse(input: &str) -> Result<Self, CoordinatorError> {
        let input = input.trim();
        let (name, args) = match input.split_once(':') {
            Some((name, args)) => (name, Some(args)),
            None => (input, None),
        };

        match name.to_ascii_lowercase().as_str() {
            "start" => parse_start(args).map(CoordinatorCommand::Task),
            "finish" => {
                let task_id = single_arg(name, args)?;
                Ok(CoordinatorCommand::Task(TaskCommand::Finish {
                    task_id: TaskId::new(task_id),
                }))
            }
            "signalready" => {
                let args = args.ok_or_else(|| missing(name))?;
                let (job_id, ud) = parse_job_step(name, args)?;
                Ok(CoordinatorCommand::SignalReady { job_id, ud })
            }
            "signalerror" => {
                let args = args.ok_or_else(|| missing(name))?;
                // The description may itself contain colons.
                let mut parts = args.splitn(3, ':');
                let job_id = parts.next().unwrap_or_default();
                let ud = parts.next().ok_or_else(|| missing(name))?;
                let description = parts.next().ok_or_else(|| missing(name))?;
                let (job_id, ud) = parse_job_step(name, &format!("{job_id}:{ud}"))?;
                Ok(CoordinatorCommand::SignalError {
                    job_id,
                    ud,
                    description: description.to_string(),
                })
            }
            "processcurrentnotification" => Ok(CoordinatorCommand::ProcessCurrentNotification),
            "updatejobblockingpolicy" => {
                let policy = single_arg(name, args)?.parse()?;
                Ok(CoordinatorCommand::UpdateJobBlockingPolicy(policy))
            }
            "breakpointcontinue" => {
                let args = args.ok_or_else(|| missing(name))?;
                if args.is_empty() {
                    return Err(missing(name));
                }
                // Breakpoint names contain colons, keep the remainder whole.
                Ok(CoordinatorCommand::BreakpointContinue(args.to_string()))
            }
            "getcurrentstate" => Ok(CoordinatorCommand::GetCurrentState),
            "getjobblockingpolicy" => Ok(CoordinatorCommand::GetJobBlockingPolicy),
            _ => Err(CoordinatorError::CommandParse(UNRECOGNIZED_COMMAND.to_string())),
        }
    }
}

fn missing(name: &str) -> CoordinatorError {
    CoordinatorError::CommandParse(format!("Missing arguments for command '{name}'"))
}

fn single_arg<'a>(name: &str, args: Option<&'a str>) -> Result<&'a str, CoordinatorError> {
    match args {
        Some(arg) if !arg.is_empty() && !arg.contains(':') => Ok(arg),
        Some(_) => Err(CoordinatorError::CommandParse(format!(
            "Command '{name}' takes exactly one argument"
        ))),
        None => Err(missing(name)),
    }
}

fn parse_job_step(name: &str, args: &str) -> Result<(String, i32), CoordinatorError> {
    let (job_id, ud) = args.split_once(':').ok_or_else(|| missing(name))?;
    if job_id.is_empty() {
        return Err(missing(name));
    }
    let ud = ud.parse::<i32>().map_err(|_| {
        CoordinatorError::CommandParse(format!("Invalid upgrade domain '{ud}' for '{name}'"))
    })?;
    Ok((job_id.to_string(), ud))
}

fn parse_start(args: Option<&str>) -> Result<TaskCommand, CoordinatorError> {
    let args = args.ok_or_else(|| missing("start"))?;
    let mut tokens = args.split(':');
    let task_id = tokens.next().filter(|t| !t.is_empty()).ok_or_else(|| missing("start"))?;

    let rest: Vec<&str> = tokens.collect();
    if rest.is_empty() || rest.len() % 2 != 0 {
        return Err(CoordinatorError::CommandParse(format!(
            "Malformed node task list for '{task_id}': expected <node>:<type> pairs"
        )));
    }

    let mut node_tasks = Vec::with_capacity(rest.len() / 2);
    for pair in rest.chunks(2) {
        let (node, task_type) = (pair[0], pair[1]);
        if node.is_empty() {
            return Err(CoordinatorError::CommandParse(format!(
                "Empty node name in task '{task_id}'"
            )));
        }
        let task_type: NodeTask = task_type.parse()?;
        node_tasks.push(NodeTaskDescription::new(node, task_type));
    }

    Ok(TaskCommand::Start {
        task_id: TaskId::new(task_id),
        node_tasks,
    })
}
