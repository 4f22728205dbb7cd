use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::{HubError, HubResult};
use crate::protocol::{Command, CommandArgs, Inbound};
use crate::runtime::admission;
use crate::runtime::engine::{FollowUp, Hub, Outcome, reported_hash, required_instance};
use crate::runtime::instances;
use crate::runtime::lock;
use crate::runtime::pipeline::{self, PipelineStage};
use crate::runtime::registry::NodeRegistration;
use crate::runtime::start::StartRequest;
use crate::task::hash::{self, HashCheck};
use crate::task::patch::Diff;
use crate::task::{ENGINE_OWNED, TaskError, TaskInstance};

/// Error payload of an `error` command, filled in from the sender.
fn task_error(body: &Value, sender: &NodeRegistration) -> TaskError {
    let mut error = match body.get("error") {
        Some(Value::String(message)) => TaskError {
            message: message.clone(),
            ..Default::default()
        },
        Some(value @ Value::Object(_)) => match serde_json::from_value(value.clone()) {
            Ok(error) => error,
            Err(e) => {
                warn!(node_id = %sender.node_id, "Malformed error payload: {}", e);
                TaskError {
                    message: value
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    ..Default::default()
                }
            }
        },
        _ => TaskError::default(),
    };
    if error.message.is_empty() {
        error.message = "Unknown error".to_string();
    }
    error
        .source_node_id
        .get_or_insert_with(|| sender.node_id.clone());
    error
        .environment
        .get_or_insert_with(|| sender.environment.clone());
    error
}

impl Hub {
    pub(crate) async fn update(&self, sender: &NodeRegistration, inbound: Inbound) -> HubResult<Outcome> {
        let args = inbound.command_args;
        let (instance_id, body, expected_hash) = if args.sync {
            let sync_task = args
                .sync_task
                .clone()
                .ok_or_else(|| HubError::Protocol("sync update without syncTask".into()))?;
            let target = sync_task
                .get("instanceId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| inbound.instance_id.clone())
                .ok_or_else(|| HubError::Protocol("sync update without instanceId".into()))?;
            (target, sync_task, None)
        } else {
            let instance_id = inbound
                .instance_id
                .clone()
                .ok_or_else(|| HubError::Protocol("missing instanceId for update".into()))?;
            let expected = reported_hash(&inbound.task);
            (instance_id, inbound.task, expected)
        };
        let mut diff = Diff::from_wire(&body)?.without(&ENGINE_OWNED);

        let guard = self.locks.acquire(&instance_id).await;
        let mut task = self.live_instance(&instance_id).await?;
        let now = self.now();

        let holder = lock::check_edit_lock(
            &instance_id,
            &task.meta,
            &sender.node_id,
            Command::Update,
            &args,
            now,
            self.config.lock_stale_after(),
        )?;
        let mut meta = task.meta.clone();
        let admission = admission::admit(&instance_id, &mut meta, &task.policy(), now)?;
        meta.locked = holder;
        task.meta = meta;

        if let Some(message) = admission.error_message() {
            warn!(instance_id = %instance_id, "{}", message);
            let error = TaskError {
                message,
                source_node_id: Some(self.config.hub_id.clone()),
                environment: None,
            };
            diff.set("error", serde_json::to_value(&error)?);
        }

        let mut candidate = task.clone();
        Self::merge_body(&mut candidate, &diff)?;
        if diff.contains("output") {
            self.store
                .record_output(&task.family_id, &task.template_id, &candidate.output)
                .await?;
        }

        if pipeline::enters_pipeline(Command::Update, Some(sender), &args, &self.exempt) {
            let chain = self.registry.pipeline();
            if let Some((position, coprocessor)) =
                pipeline::next_coprocessor(&chain, Command::Update, &[])
            {
                // lock and admission take effect on arrival
                self.store.put_instance(&task).await?;
                let stage = PipelineStage::new(
                    Command::Update,
                    &instance_id,
                    Some(sender.node_id.clone()),
                    args,
                    candidate.to_value()?,
                    &diff,
                    expected_hash,
                    now,
                );
                return self.park(stage, coprocessor, position).await;
            }
        }

        let (outcome, follow) = self
            .commit_change(task, diff, Command::Update, Some(&sender.node_id), &args, expected_hash, false)
            .await?;
        drop(guard);
        let next = self.run_follow_up(follow).await;
        Ok(outcome.chained(next))
    }

    pub(crate) async fn error(&self, sender: &NodeRegistration, inbound: Inbound) -> HubResult<Outcome> {
        self.admit_error().await?;
        let instance_id = required_instance(&inbound)?;
        let args = inbound.command_args;

        let mut diff = Diff::from_wire(&inbound.task)?.without(&ENGINE_OWNED);
        let error = task_error(&inbound.task, sender);
        diff.set("error", serde_json::to_value(&error)?);

        let guard = self.locks.acquire(&instance_id).await;
        let mut task = self
            .store
            .instance(&instance_id)
            .await?
            .ok_or_else(|| HubError::NotFound(instance_id.clone()))?;

        task.meta.locked = lock::check_edit_lock(
            &instance_id,
            &task.meta,
            &sender.node_id,
            Command::Error,
            &args,
            self.now(),
            self.config.lock_stale_after(),
        )?;

        if pipeline::enters_pipeline(Command::Error, Some(sender), &args, &self.exempt) {
            let chain = self.registry.pipeline();
            if let Some((position, coprocessor)) =
                pipeline::next_coprocessor(&chain, Command::Error, &[])
            {
                self.store.put_instance(&task).await?;
                let mut candidate = task.clone();
                Self::merge_body(&mut candidate, &diff)?;
                let stage = PipelineStage::new(
                    Command::Error,
                    &instance_id,
                    Some(sender.node_id.clone()),
                    args,
                    candidate.to_value()?,
                    &diff,
                    None,
                    self.now(),
                );
                return self.park(stage, coprocessor, position).await;
            }
        }

        let (outcome, follow) = self
            .commit_change(task, diff, Command::Error, Some(&sender.node_id), &args, None, false)
            .await?;
        drop(guard);
        let next = self.run_follow_up(follow).await;
        Ok(outcome.chained(next))
    }

    /// Merges a change into the stored record, persists and fans it out.
    ///
    /// Caller holds the instance mutex. Chained starts and error routing come
    /// back as a [`FollowUp`] to run after the mutex is released.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn commit_change(
        &self,
        mut task: TaskInstance,
        diff: Diff,
        command: Command,
        source: Option<&str>,
        args: &CommandArgs,
        expected_hash: Option<u32>,
        rewritten: bool,
    ) -> HubResult<(Outcome, Option<FollowUp>)> {
        let now = self.now();
        let instance_id = task.instance_id.clone();
        Self::merge_body(&mut task, &diff)?;

        if let HashCheck::Mismatch { expected, actual } = hash::verify(expected_hash, &task.to_value()?) {
            warn!(
                instance_id = %instance_id,
                node_id = ?source,
                expected,
                actual,
                "Task hash mismatch after merge"
            );
        }

        task.meta.update_count += 1;
        task.meta.updated_at = Some(now);
        task.meta.last_updated_at = Some(now);
        task.meta.modified = diff.modified_tree();
        task.meta.broadcast_count = self.sync.next_broadcast_count();
        task.rehash()?;
        self.store.put_instance(&task).await?;

        // a sender whose change was rewritten gets the result back
        if let Some(source) = source.filter(|_| !rewritten) {
            self.sync.record_sender_view(&instance_id, source, &diff).await?;
        }
        let report = self.sync.broadcast(&task, command, source, args).await?;
        self.prune_gone(&instance_id, &report).await?;

        let error_raised =
            command == Command::Error || (diff.contains("error") && task.error.is_some());
        if error_raised {
            let follow = FollowUp::RouteError {
                instance_id: instance_id.clone(),
                error_task: args.error_task.clone(),
            };
            if args.done {
                self.active.deactivate(&instance_id).await?;
            }
            let outcome = if command == Command::Error {
                Outcome::ErrorRouted {
                    instance_id,
                    handler_instance_id: None,
                }
            } else {
                Outcome::Committed {
                    instance_id,
                    update_count: task.meta.update_count,
                }
            };
            return Ok((outcome, Some(follow)));
        }

        if args.done {
            self.active.deactivate(&instance_id).await?;
            info!(instance_id = %instance_id, template_id = %task.template_id, "Task done");
            let follow = args.next_task_id.as_ref().map(|next| {
                FollowUp::Chain(StartRequest {
                    user_id: task.user_id.clone(),
                    group_id: task.group_id.clone(),
                    family_id: Some(task.family_id.clone()),
                    thread_id: task.thread_id.clone(),
                    prev_instance_id: Some(instance_id.clone()),
                    source: source.and_then(|s| self.registry.get(s)),
                    ..StartRequest::new(next)
                })
            });
            return Ok((
                Outcome::Completed {
                    instance_id,
                    next_instance_id: None,
                },
                follow,
            ));
        }

        Ok((
            Outcome::Committed {
                instance_id,
                update_count: task.meta.update_count,
            },
            None,
        ))
    }

    /// Handles a coprocessor's reply to a parked stage.
    pub(crate) async fn resume_stage(&self, sender: &NodeRegistration, inbound: Inbound) -> HubResult<Outcome> {
        let ticket = inbound
            .pipeline
            .clone()
            .ok_or_else(|| HubError::Protocol("missing pipeline ticket".into()))?;
        let instance_id = inbound
            .instance_id
            .clone()
            .ok_or_else(|| HubError::Protocol("pipeline reply without instanceId".into()))?;

        let guard = self.locks.acquire(&instance_id).await;
        let mut stage = self
            .active
            .stage(&instance_id, &ticket.ticket)
            .await?
            .ok_or_else(|| HubError::Protocol(format!("unknown pipeline ticket {}", ticket.ticket)))?;
        if stage.awaiting != sender.node_id {
            return Err(HubError::Protocol(format!(
                "ticket {} is not held by {}",
                ticket.ticket, sender.node_id
            )));
        }

        let reply = Diff::from_wire(&inbound.task)?.without(&ENGINE_OWNED);
        stage.absorb(&reply);
        stage.visited.push(sender.node_id.clone());

        let (outcome, follow) = if inbound.command_args.coprocessing_done {
            self.finish_stage(stage).await?
        } else {
            self.continue_stage(stage).await?
        };
        drop(guard);
        let next = self.run_follow_up(follow).await;
        Ok(outcome.chained(next))
    }

    /// Hands the stage to the next accepting coprocessor, or commits it.
    pub(crate) async fn continue_stage(
        &self,
        stage: PipelineStage,
    ) -> HubResult<(Outcome, Option<FollowUp>)> {
        let chain = self.registry.pipeline();
        match pipeline::next_coprocessor(&chain, stage.command, &stage.visited) {
            Some((position, coprocessor)) => {
                let outcome = self.park(stage, coprocessor, position).await?;
                Ok((outcome, None))
            }
            None => self.finish_stage(stage).await,
        }
    }

    async fn finish_stage(&self, stage: PipelineStage) -> HubResult<(Outcome, Option<FollowUp>)> {
        self.active.take_stage(&stage.instance_id, &stage.ticket).await?;
        let source = stage.initiating_node_id.as_deref();

        if stage.command == Command::Init {
            let task = TaskInstance::from_value(stage.task.clone())
                .map_err(|e| HubError::Protocol(format!("coprocessor broke the task: {:#}", e)))?;
            let outcome = self.commit_init(task, source).await?;
            return Ok((outcome, None));
        }

        let Some(task) = self.store.instance(&stage.instance_id).await? else {
            self.active.release_if_idle(&stage.instance_id).await?;
            return Err(HubError::NotFound(stage.instance_id.clone()));
        };
        let result = self
            .commit_change(
                task,
                stage.diff.clone(),
                stage.command,
                source,
                &stage.command_args,
                stage.expected_hash,
                stage.rewritten,
            )
            .await;
        self.active.release_if_idle(&stage.instance_id).await?;
        result
    }

    /// Starts the error handler for a failed instance. Returns the handler's id.
    pub(crate) async fn route_error(&self, instance_id: &str, error_task: Option<String>) -> Option<String> {
        match self.try_route_error(instance_id, error_task).await {
            Ok(handler) => handler,
            Err(e) => {
                warn!(instance_id = %instance_id, "Error routing failed: {}", e);
                None
            }
        }
    }

    async fn try_route_error(&self, instance_id: &str, error_task: Option<String>) -> HubResult<Option<String>> {
        let Some(task) = self.store.instance(instance_id).await? else {
            return Ok(None);
        };
        if task.is_error_handler() {
            warn!(instance_id = %instance_id, template_id = %task.template_id, "Error inside an error handler, not routed");
            return Ok(None);
        }
        let Some(error) = task.error.clone() else {
            return Ok(None);
        };

        let handler = match task.policy().error_task.or(error_task) {
            Some(handler) => Some(handler),
            None => self.closest_error_handler(&task.template_id).await?,
        };
        let Some(handler) = handler else {
            warn!(instance_id = %instance_id, template_id = %task.template_id, "No error handler found");
            return Ok(None);
        };

        let mut body = Diff::new();
        body.set(
            "response",
            json!({
                "error": error.message,
                "environment": error.environment,
                "sourceNodeId": error.source_node_id,
                "instanceId": instance_id,
            }),
        );
        let request = StartRequest {
            user_id: task.user_id.clone(),
            group_id: task.group_id.clone(),
            family_id: Some(task.family_id.clone()),
            parent_instance_id: Some(instance_id.to_string()),
            body,
            ..StartRequest::new(&handler)
        };
        let outcome = self.start(request).await?;
        let handler_instance_id = outcome.instance_id().map(str::to_string);

        if let Some(handler_id) = &handler_instance_id {
            let _guard = self.locks.acquire(instance_id).await;
            if let Some(mut task) = self.store.instance(instance_id).await? {
                task.meta.error_handler_instance_id = Some(handler_id.clone());
                self.store.put_instance(&task).await?;
            }
        }
        info!(
            instance_id = %instance_id,
            handler = %handler,
            handler_instance_id = ?handler_instance_id,
            "Error routed"
        );
        Ok(handler_instance_id)
    }

    /// First existing template on the upward `*.error` walk.
    async fn closest_error_handler(&self, template_id: &str) -> HubResult<Option<String>> {
        for candidate in instances::error_handler_candidates(template_id) {
            if self.ctx.template(&candidate).await?.is_some() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}
