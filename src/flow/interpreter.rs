//! Tick-based flow interpreter
//!
//! One call to [`Interpreter::tick`] processes one event against every flow
//! instance of a conversation:
//!
//! 1. `ContextUpdate` events merge their `data` map into the context.
//! 2. `ActionFinished`/`RetrievalFinished` resume the instance awaiting the
//!    correlation id; completions nobody awaits are dropped.
//! 3. Instances suspended at a match point test the event.
//! 4. Every event-started flow whose entry pattern accepts the event spawns
//!    an instance (non-parallel flows only while none is live).
//! 5. Runnable instances execute until they suspend, terminate or reach a
//!    decision point.
//! 6. The first instance at a decision point, in evaluation order, performs
//!    its step. The others stay parked for the next tick unless the winner is
//!    an extension flow, which aborts every lower-priority contender.
//!
//! Evaluation order is priority descending, then definition order, then
//! instance creation order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use super::EvalError;
use super::ast::{DEFAULT_PRIORITY, Target};
use super::expr::{Expr, FrameScope};
use super::instance::{AbortReason, Awaiting, Candidate, FlowInstance, InstanceId, InstanceStatus};
use super::ir::{FlowSet, Instruction};
use super::value::Value;
use crate::runtime::event::{Event, EventDraft, kinds};
use crate::runtime::state::ConversationState;

/// Subflow calls nested deeper than this abort the caller.
pub const MAX_SUBFLOW_DEPTH: u32 = 32;

/// Flows started by `Start` or `Subflow` while processing one event. The
/// instance that would exceed it is aborted.
pub const MAX_STARTS_PER_TICK: usize = 256;

/// Stored conversation state that cannot be executed against the loaded flows.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InterpreterError {
    /// The instance refers to a flow that is not part of the flow set.
    #[error("instance {instance} refers to flow '{flow}' which is not loaded")]
    UnknownFlow {
        /// Offending instance.
        instance: InstanceId,
        /// Flow name recorded on the instance.
        flow: String,
    },

    /// The instance's program counter or status does not fit its flow.
    #[error("instance {instance} is inconsistent: {detail}")]
    CorruptInstance {
        /// Offending instance.
        instance: InstanceId,
        /// What is wrong.
        detail: String,
    },
}

impl InterpreterError {
    /// Instance the error is about.
    pub fn instance(&self) -> InstanceId {
        match self {
            InterpreterError::UnknownFlow { instance, .. }
            | InterpreterError::CorruptInstance { instance, .. } => *instance,
        }
    }
}

/// Executes a [`FlowSet`] against conversation states.
#[derive(Debug, Clone)]
pub struct Interpreter {
    flows: Arc<FlowSet>,
    max_steps: usize,
}

impl Interpreter {
    /// Interpreter over `flows`; `max_steps` bounds non-suspending
    /// instructions per advance.
    pub fn new(flows: Arc<FlowSet>, max_steps: usize) -> Self {
        Self {
            flows,
            max_steps: max_steps.max(1),
        }
    }

    /// Loaded flows.
    pub fn flows(&self) -> &FlowSet {
        &self.flows
    }

    /// Check that every live instance can run against the loaded flows.
    /// Reports the first instance that cannot.
    pub fn validate_state(&self, state: &ConversationState) -> Result<(), InterpreterError> {
        state
            .live_instances()
            .try_for_each(|inst| self.check_instance(inst))
    }

    fn check_instance(&self, inst: &FlowInstance) -> Result<(), InterpreterError> {
        let flow = self
            .flows
            .get(inst.flow)
            .filter(|flow| flow.name == inst.flow_name)
            .ok_or_else(|| InterpreterError::UnknownFlow {
                instance: inst.id,
                flow: inst.flow_name.clone(),
            })?;
        if inst.head > flow.code.len() {
            return Err(InterpreterError::CorruptInstance {
                instance: inst.id,
                detail: format!("head {} past end of '{}'", inst.head, flow.name),
            });
        }
        let at_match = matches!(flow.code.get(inst.head), Some(Instruction::Match(_)));
        if inst.status == InstanceStatus::ActiveMatching && !at_match {
            return Err(InterpreterError::CorruptInstance {
                instance: inst.id,
                detail: "matching instance is not at a match point".to_string(),
            });
        }
        Ok(())
    }

    /// Process one event. Returns the events produced, in order.
    ///
    /// Instances that no longer fit the loaded flows are aborted with an
    /// `InternalError` before the event is processed; the remaining
    /// instances see the event as usual.
    pub fn tick(&self, state: &mut ConversationState, event: &Event) -> Vec<EventDraft> {
        let misfits: Vec<InterpreterError> = state
            .live_instances()
            .filter_map(|inst| self.check_instance(inst).err())
            .collect();

        let mut tick = Tick {
            flows: &self.flows,
            state,
            out: Vec::new(),
            max_steps: self.max_steps,
            started: 0,
        };
        for err in misfits {
            tick.reject(err);
        }
        tick.apply_context_update(event);
        tick.route_completion(event);
        tick.match_waiting(event);
        tick.spawn(event);
        let parked = tick.advance_all();
        tick.decide(parked);
        tick.out
    }

    /// Abort one instance from outside a tick (used by the runtime backstop).
    pub fn abort_instance(
        &self,
        state: &mut ConversationState,
        id: InstanceId,
        reason: AbortReason,
    ) -> Vec<EventDraft> {
        let mut tick = Tick {
            flows: &self.flows,
            state,
            out: Vec::new(),
            max_steps: self.max_steps,
            started: 0,
        };
        if let Some(pos) = tick.pos(id) {
            tick.abort(pos, reason);
        }
        tick.out
    }
}

struct Tick<'a> {
    flows: &'a FlowSet,
    state: &'a mut ConversationState,
    out: Vec<EventDraft>,
    max_steps: usize,
    started: usize,
}

enum Stop {
    Parked,
    Suspended,
    Terminated,
}

impl<'a> Tick<'a> {
    fn pos(&self, id: InstanceId) -> Option<usize> {
        self.state
            .instances
            .binary_search_by_key(&id, |inst| inst.id)
            .ok()
    }

    fn inst(&self, pos: usize) -> &FlowInstance {
        &self.state.instances[pos]
    }

    fn inst_mut(&mut self, pos: usize) -> &mut FlowInstance {
        &mut self.state.instances[pos]
    }

    fn instr(&self, pos: usize) -> Option<&'a Instruction> {
        let flows: &'a FlowSet = self.flows;
        let inst = self.inst(pos);
        flows.get(inst.flow)?.code.get(inst.head)
    }

    fn priority(&self, pos: usize) -> f64 {
        self.flows
            .get(self.inst(pos).flow)
            .map_or(DEFAULT_PRIORITY, |flow| flow.priority)
    }

    fn is_extension(&self, pos: usize) -> bool {
        self.flows
            .get(self.inst(pos).flow)
            .is_some_and(|flow| flow.flags.extension)
    }

    fn evaluation_order(&self, a: usize, b: usize) -> Ordering {
        let (ia, ib) = (self.inst(a), self.inst(b));
        self.priority(b)
            .total_cmp(&self.priority(a))
            .then(ia.flow.cmp(&ib.flow))
            .then(ia.id.cmp(&ib.id))
    }

    fn sorted(&self, mut positions: Vec<usize>) -> Vec<usize> {
        positions.sort_by(|a, b| self.evaluation_order(*a, *b));
        positions
    }

    fn eval(&self, pos: usize, expr: &Expr) -> Result<Value, EvalError> {
        let inst = self.inst(pos);
        expr.eval(&FrameScope::new(&inst.locals, &self.state.context))
    }

    fn eval_map(
        &self,
        pos: usize,
        exprs: &BTreeMap<String, Expr>,
    ) -> Result<BTreeMap<String, Value>, EvalError> {
        exprs
            .iter()
            .map(|(key, expr)| Ok((key.clone(), self.eval(pos, expr)?)))
            .collect()
    }

    fn eval_text(&self, pos: usize, expr: &Expr) -> Result<String, EvalError> {
        let value = self.eval(pos, expr)?;
        Ok(value.expect_str()?.to_string())
    }

    fn bind(&mut self, pos: usize, target: &Target, value: Value) {
        match target {
            Target::Local(name) => {
                self.inst_mut(pos).locals.insert(name.clone(), value);
            }
            Target::Context(name) => {
                self.state.context.set(name.clone(), value);
            }
        }
    }

    fn lifecycle(&self, event_type: &str, pos: usize) -> EventDraft {
        let inst = self.inst(pos);
        EventDraft::new(event_type)
            .with("flow", inst.flow_name.as_str())
            .with("instance", inst.id)
    }

    fn new_instance(&mut self, flow: usize, parent: Option<usize>) -> usize {
        let id = self.state.mint_instance_id();
        let name = self
            .flows
            .get(flow)
            .map(|f| f.name.clone())
            .unwrap_or_default();
        let mut inst = FlowInstance::new(id, flow, name);
        if let Some(parent) = parent {
            inst.parent = Some(self.inst(parent).id);
            inst.depth = self.inst(parent).depth + 1;
        }
        self.state.instances.push(inst);
        let pos = self.state.instances.len() - 1;

        let mut started = self.lifecycle(kinds::FLOW_STARTED, pos);
        if let Some(parent) = parent {
            started = started.with("parent", self.inst(parent).id);
        }
        tracing::info!(flow = %self.inst(pos).flow_name, instance = %id, "flow started");
        self.out.push(started);
        pos
    }

    fn complete(&mut self, pos: usize) {
        let inst = self.inst_mut(pos);
        inst.status = InstanceStatus::Completed;
        inst.awaiting = None;
        inst.candidates = None;
        let (id, parent) = (inst.id, inst.parent);
        tracing::info!(flow = %self.inst(pos).flow_name, instance = %id, "flow finished");
        self.out.push(self.lifecycle(kinds::FLOW_FINISHED, pos));

        if let Some(parent_pos) = parent.and_then(|p| self.pos(p)) {
            let parent = self.inst_mut(parent_pos);
            if parent.awaiting == Some(Awaiting::Subflow { child: id }) {
                parent.awaiting = None;
                parent.head += 1;
                parent.status = InstanceStatus::Advancing;
            }
        }
    }

    fn abort(&mut self, pos: usize, reason: AbortReason) {
        if self.inst(pos).status.is_terminal() {
            return;
        }
        let inst = self.inst_mut(pos);
        inst.status = InstanceStatus::Aborted;
        inst.candidates = None;
        let awaiting = inst.awaiting.take();
        let (id, parent) = (inst.id, inst.parent);

        tracing::info!(
            flow = %self.inst(pos).flow_name,
            instance = %id,
            reason = %reason,
            "flow aborted"
        );
        self.out
            .push(self.lifecycle(kinds::FLOW_ABORTED, pos).with("reason", reason.as_str()));

        match awaiting {
            Some(Awaiting::Action {
                correlation_id,
                action,
            }) => self.out.push(
                EventDraft::new(kinds::STOP_ACTION)
                    .with("action_name", action)
                    .with("correlation_id", correlation_id),
            ),
            Some(Awaiting::Retrieval {
                correlation_id,
                index,
            }) => self.out.push(
                EventDraft::new(kinds::STOP_ACTION)
                    .with("index", index)
                    .with("correlation_id", correlation_id),
            ),
            Some(Awaiting::Subflow { child }) => {
                if let Some(child_pos) = self.pos(child) {
                    self.abort(child_pos, AbortReason::ParentAborted);
                }
            }
            None => {}
        }

        if let Some(parent_pos) = parent.and_then(|p| self.pos(p)) {
            if self.inst(parent_pos).awaiting == Some(Awaiting::Subflow { child: id }) {
                self.abort(parent_pos, AbortReason::SubflowAborted);
            }
        }
    }

    fn flow_error(&mut self, pos: usize, message: String, reason: AbortReason) {
        tracing::warn!(
            flow = %self.inst(pos).flow_name,
            instance = %self.inst(pos).id,
            error = %message,
            "flow error"
        );
        self.out
            .push(self.lifecycle(kinds::FLOW_ERROR, pos).with("message", message));
        self.abort(pos, reason);
    }

    fn corrupt(&mut self, pos: usize, detail: &str) {
        self.reject(InterpreterError::CorruptInstance {
            instance: self.inst(pos).id,
            detail: detail.to_string(),
        });
    }

    /// Abort an instance that cannot run, reporting why.
    fn reject(&mut self, err: InterpreterError) {
        let Some(pos) = self.pos(err.instance()) else {
            return;
        };
        let message = err.to_string();
        self.out.push(
            self.lifecycle(kinds::INTERNAL_ERROR, pos)
                .with("message", message.as_str()),
        );
        tracing::warn!(error = %message, "aborting inconsistent instance");
        self.abort(pos, AbortReason::Internal);
    }

    /// Take the failure branch or abort.
    fn fail(&mut self, pos: usize, on_failure: Option<usize>, error: Value, reason: AbortReason) {
        if let Some(target) = on_failure {
            let inst = self.inst_mut(pos);
            inst.locals.insert("error".to_string(), error);
            inst.candidates = None;
            inst.head = target;
            inst.status = InstanceStatus::Advancing;
            return;
        }
        self.abort(pos, reason);
    }

    // Phase 1

    fn apply_context_update(&mut self, event: &Event) {
        if !event.is(kinds::CONTEXT_UPDATE) {
            return;
        }
        match event.get("data") {
            Some(Value::Map(data)) => self.state.context.merge(data),
            _ => tracing::warn!(event = %event.id, "context update without a data map"),
        }
    }

    // Phase 2

    fn route_completion(&mut self, event: &Event) {
        let is_action = event.is(kinds::ACTION_FINISHED);
        if !is_action && !event.is(kinds::RETRIEVAL_FINISHED) {
            return;
        }
        let Some(correlation_id) = event.get_str("correlation_id") else {
            return;
        };
        let Some(pos) = (0..self.state.instances.len())
            .find(|&pos| self.inst(pos).is_live() && self.inst(pos).awaits(correlation_id))
        else {
            tracing::debug!(correlation_id, "discarding completion nobody awaits");
            return;
        };

        self.inst_mut(pos).awaiting = None;
        let success = event.get_str("status") == Some("success");
        let error = event
            .get("error")
            .cloned()
            .unwrap_or_else(|| Value::from("unknown error"));

        match (self.instr(pos), is_action) {
            (Some(Instruction::Execute { action, output, on_failure, .. }), true) => {
                if success {
                    if let Some(target) = output {
                        let value = event.get("return_value").cloned().unwrap_or_default();
                        self.bind(pos, target, value);
                    }
                    self.resume_next(pos);
                } else if on_failure.is_some() {
                    self.fail(pos, *on_failure, error, AbortReason::ActionFailed);
                } else {
                    self.out.push(
                        self.lifecycle(kinds::ACTION_FAILED, pos)
                            .with("action_name", action.as_str())
                            .with("correlation_id", correlation_id)
                            .with("error", error.clone()),
                    );
                    self.abort(pos, AbortReason::ActionFailed);
                }
            }
            (Some(Instruction::GenerateCanonicalForm { chooser, output, on_failure, .. }), true) => {
                if success {
                    let value = event.get("return_value").cloned().unwrap_or_default();
                    self.bind(pos, output, value);
                    self.inst_mut(pos).candidates = None;
                    self.resume_next(pos);
                } else if on_failure.is_some() {
                    self.fail(pos, *on_failure, error, AbortReason::ActionFailed);
                } else {
                    self.out.push(
                        self.lifecycle(kinds::ACTION_FAILED, pos)
                            .with("action_name", chooser.as_str())
                            .with("correlation_id", correlation_id)
                            .with("error", error.clone()),
                    );
                    self.abort(pos, AbortReason::ActionFailed);
                }
            }
            (Some(Instruction::GenerateCanonicalForm { on_failure, .. }), false) => {
                let candidates = if success {
                    candidates_from(event.get("results"))
                } else {
                    Vec::new()
                };
                if candidates.is_empty() {
                    let error = if success {
                        Value::from("no canonical form candidates")
                    } else {
                        error
                    };
                    self.retrieval_failed(pos, *on_failure, error);
                } else {
                    let inst = self.inst_mut(pos);
                    inst.candidates = Some(candidates);
                    inst.status = InstanceStatus::Advancing;
                }
            }
            (Some(Instruction::Retrieve { output, on_failure, .. }), false) => {
                if success {
                    let value = event
                        .get("results")
                        .cloned()
                        .unwrap_or(Value::List(Vec::new()));
                    self.bind(pos, output, value);
                    self.resume_next(pos);
                } else {
                    self.retrieval_failed(pos, *on_failure, error);
                }
            }
            _ => self.corrupt(pos, "completion does not fit the awaiting instruction"),
        }
    }

    fn resume_next(&mut self, pos: usize) {
        let inst = self.inst_mut(pos);
        inst.head += 1;
        inst.status = InstanceStatus::Advancing;
    }

    fn retrieval_failed(&mut self, pos: usize, on_failure: Option<usize>, error: Value) {
        if on_failure.is_some() {
            self.fail(pos, on_failure, error, AbortReason::RetrievalFailed);
        } else {
            self.flow_error(
                pos,
                format!("retrieval failed: {error}"),
                AbortReason::RetrievalFailed,
            );
        }
    }

    // Phase 3

    fn match_waiting(&mut self, event: &Event) {
        let waiting: Vec<usize> = (0..self.state.instances.len())
            .filter(|&pos| self.inst(pos).status == InstanceStatus::ActiveMatching)
            .collect();

        for pos in self.sorted(waiting) {
            let Some(Instruction::Match(pattern)) = self.instr(pos) else {
                self.corrupt(pos, "matching instance is not at a match point");
                continue;
            };
            let outcome = {
                let inst = self.inst(pos);
                let scope = FrameScope::new(&inst.locals, &self.state.context);
                pattern.matches(&event.event_type, &event.payload, &scope)
            };
            match outcome {
                Ok(Some(captures)) => {
                    let inst = self.inst_mut(pos);
                    inst.locals.extend(captures);
                    inst.head += 1;
                    inst.status = InstanceStatus::Advancing;
                }
                Ok(None) => {}
                Err(err) => self.flow_error(
                    pos,
                    format!("matching failed: {err}"),
                    AbortReason::EvaluationError,
                ),
            }
        }
    }

    // Phase 4

    fn spawn(&mut self, event: &Event) {
        let flows: &'a FlowSet = self.flows;
        for (idx, flow) in flows.iter() {
            let Some(pattern) = flow.entry_pattern() else {
                continue;
            };
            if !pattern.accepts_type(&event.event_type) {
                continue;
            }
            if !flow.flags.parallel
                && self
                    .state
                    .instances
                    .iter()
                    .any(|inst| inst.flow == idx && inst.is_live())
            {
                continue;
            }

            match pattern.matches(&event.event_type, &event.payload, &self.state.context) {
                Ok(Some(captures)) => {
                    let pos = self.new_instance(idx, None);
                    let inst = self.inst_mut(pos);
                    inst.locals = captures;
                    inst.head = 1;
                    inst.status = InstanceStatus::Advancing;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(flow = %flow.name, error = %err, "entry pattern failed");
                    self.out.push(
                        EventDraft::new(kinds::FLOW_ERROR)
                            .with("flow", flow.name.as_str())
                            .with("message", format!("matching failed: {err}")),
                    );
                }
            }
        }
    }

    // Phase 5

    fn advance_all(&mut self) -> Vec<usize> {
        let mut parked = HashSet::new();
        loop {
            let next = (0..self.state.instances.len())
                .filter(|pos| !parked.contains(pos))
                .filter(|&pos| {
                    matches!(
                        self.inst(pos).status,
                        InstanceStatus::Pending | InstanceStatus::Advancing
                    )
                })
                .min_by(|a, b| self.evaluation_order(*a, *b));
            let Some(pos) = next else {
                break;
            };
            if let Stop::Parked = self.advance(pos) {
                parked.insert(pos);
            }
        }
        parked.into_iter().collect()
    }

    fn advance(&mut self, pos: usize) -> Stop {
        if self.inst(pos).status == InstanceStatus::Pending {
            self.inst_mut(pos).status = InstanceStatus::Advancing;
        }

        let mut steps = 0usize;
        loop {
            let Some(instr) = self.instr(pos) else {
                self.complete(pos);
                return Stop::Terminated;
            };
            steps += 1;
            if steps > self.max_steps {
                self.flow_error(
                    pos,
                    format!("exceeded {} steps without suspending", self.max_steps),
                    AbortReason::StepLimit,
                );
                return Stop::Terminated;
            }

            match instr {
                Instruction::Match(_) => {
                    self.inst_mut(pos).status = InstanceStatus::ActiveMatching;
                    return Stop::Suspended;
                }
                Instruction::Execute { .. } | Instruction::Emit { .. } | Instruction::Retrieve { .. } => {
                    return Stop::Parked;
                }
                Instruction::Assign { target, value } => match self.eval(pos, value) {
                    Ok(value) => {
                        self.bind(pos, target, value);
                        self.inst_mut(pos).head += 1;
                    }
                    Err(err) => {
                        self.flow_error(pos, err.to_string(), AbortReason::EvaluationError);
                        return Stop::Terminated;
                    }
                },
                Instruction::JumpUnless { condition, target } => match self.eval(pos, condition) {
                    Ok(value) => {
                        let inst = self.inst_mut(pos);
                        inst.head = if value.is_truthy() { inst.head + 1 } else { *target };
                    }
                    Err(err) => {
                        self.flow_error(pos, err.to_string(), AbortReason::EvaluationError);
                        return Stop::Terminated;
                    }
                },
                Instruction::Jump(target) => self.inst_mut(pos).head = *target,
                Instruction::CallSubflow(flow) => {
                    if self.inst(pos).depth >= MAX_SUBFLOW_DEPTH {
                        self.flow_error(
                            pos,
                            format!("subflows nested deeper than {MAX_SUBFLOW_DEPTH}"),
                            AbortReason::SubflowDepth,
                        );
                        return Stop::Terminated;
                    }
                    if !self.charge_start(pos) {
                        return Stop::Terminated;
                    }
                    let child = self.new_instance(*flow, Some(pos));
                    let child_id = self.inst(child).id;
                    let inst = self.inst_mut(pos);
                    inst.status = InstanceStatus::AwaitingSubflow;
                    inst.awaiting = Some(Awaiting::Subflow { child: child_id });
                    return Stop::Suspended;
                }
                Instruction::StartFlow(flow) => {
                    let already_live = self
                        .state
                        .instances
                        .iter()
                        .any(|inst| inst.flow == *flow && inst.is_live());
                    let parallel = self.flows.get(*flow).is_some_and(|f| f.flags.parallel);
                    if already_live && !parallel {
                        tracing::debug!(flow = *flow, "flow already running, start skipped");
                    } else {
                        if !self.charge_start(pos) {
                            return Stop::Terminated;
                        }
                        self.new_instance(*flow, None);
                    }
                    self.inst_mut(pos).head += 1;
                }
                Instruction::GenerateCanonicalForm {
                    input,
                    index,
                    output,
                    ..
                } => {
                    if self.inst(pos).candidates.is_some() {
                        return Stop::Parked;
                    }
                    let text = match self.eval_text(pos, input) {
                        Ok(text) => text,
                        Err(err) => {
                            self.flow_error(pos, err.to_string(), AbortReason::EvaluationError);
                            return Stop::Terminated;
                        }
                    };
                    match self.flows.examples().lookup(index, &text) {
                        Some(form) => {
                            let form = Value::from(form);
                            self.bind(pos, output, form);
                            self.inst_mut(pos).head += 1;
                        }
                        None => return Stop::Parked,
                    }
                }
                Instruction::Return => {
                    self.complete(pos);
                    return Stop::Terminated;
                }
                Instruction::Abort => {
                    self.abort(pos, AbortReason::Explicit);
                    return Stop::Terminated;
                }
            }
        }
    }

    /// Count a flow start against the tick budget; on overrun the starting
    /// instance fails instead.
    fn charge_start(&mut self, pos: usize) -> bool {
        if self.started >= MAX_STARTS_PER_TICK {
            self.flow_error(
                pos,
                format!("started more than {MAX_STARTS_PER_TICK} flows for one event"),
                AbortReason::StartLimit,
            );
            return false;
        }
        self.started += 1;
        true
    }

    // Phase 6

    fn decide(&mut self, parked: Vec<usize>) {
        let contenders = self.sorted(parked);
        let mut winner = None;
        for &pos in &contenders {
            if self.inst(pos).status != InstanceStatus::Advancing {
                continue;
            }
            if self.perform(pos) {
                winner = Some(pos);
                break;
            }
        }

        let Some(winner) = winner else {
            return;
        };
        if !self.is_extension(winner) {
            return;
        }
        let priority = self.priority(winner);
        for &pos in &contenders {
            if pos != winner
                && self.inst(pos).status == InstanceStatus::Advancing
                && self.priority(pos) < priority
            {
                self.abort(pos, AbortReason::Interrupted);
            }
        }
    }

    /// Perform the decision step of a parked instance. Returns `false` when
    /// the instance failed instead.
    fn perform(&mut self, pos: usize) -> bool {
        let Some(instr) = self.instr(pos) else {
            self.corrupt(pos, "parked past the end of its flow");
            return false;
        };
        let (flow, id) = (self.inst(pos).flow_name.clone(), self.inst(pos).id);

        let result = match instr {
            Instruction::Execute { action, params, .. } => self
                .eval_map(pos, params)
                .map(|params| self.start_action(pos, action, params)),
            Instruction::Emit {
                event_type,
                payload,
            } => self.eval_map(pos, payload).map(|payload| {
                self.out.push(EventDraft {
                    event_type: event_type.clone(),
                    payload,
                });
                self.inst_mut(pos).head += 1;
            }),
            Instruction::Retrieve {
                index,
                query,
                max_results,
                max_distance,
                ..
            } => self
                .eval_text(pos, query)
                .map(|query| self.start_retrieval(pos, index, query, *max_results, *max_distance)),
            Instruction::GenerateCanonicalForm {
                input,
                index,
                max_candidates,
                chooser,
                ..
            } => self.eval_text(pos, input).map(|text| {
                match self.inst(pos).candidates.clone() {
                    Some(candidates) => {
                        let mut params = BTreeMap::new();
                        params.insert("text".to_string(), Value::String(text));
                        params.insert(
                            "candidates".to_string(),
                            Value::List(candidates.iter().map(Candidate::to_value).collect()),
                        );
                        params.insert(
                            "history".to_string(),
                            Value::List(self.state.history.iter().map(|h| h.to_value()).collect()),
                        );
                        self.start_action(pos, chooser, params);
                    }
                    None => self.start_retrieval(pos, index, text, *max_candidates, None),
                }
            }),
            _ => {
                self.corrupt(pos, "parked at a non-decision instruction");
                return false;
            }
        };

        match result {
            Ok(()) => {
                tracing::debug!(flow = %flow, instance = %id, "decision taken");
                true
            }
            Err(err) => {
                self.flow_error(pos, err.to_string(), AbortReason::EvaluationError);
                false
            }
        }
    }

    fn start_action(&mut self, pos: usize, action: &str, params: BTreeMap<String, Value>) {
        let correlation_id = self.state.mint_correlation_id();
        self.out.push(
            self.lifecycle(kinds::ACTION_STARTED, pos)
                .with("action_name", action)
                .with("params", Value::Map(params))
                .with("correlation_id", correlation_id.as_str()),
        );
        let inst = self.inst_mut(pos);
        inst.status = InstanceStatus::AwaitingAction;
        inst.awaiting = Some(Awaiting::Action {
            correlation_id,
            action: action.to_string(),
        });
    }

    fn start_retrieval(
        &mut self,
        pos: usize,
        index: &str,
        query: String,
        max_results: usize,
        max_distance: Option<f32>,
    ) {
        let correlation_id = self.state.mint_correlation_id();
        let mut started = self
            .lifecycle(kinds::RETRIEVAL_STARTED, pos)
            .with("index", index)
            .with("query", query)
            .with("max_results", max_results)
            .with("correlation_id", correlation_id.as_str());
        if let Some(max_distance) = max_distance {
            started = started.with("max_distance", f64::from(max_distance));
        }
        self.out.push(started);
        let inst = self.inst_mut(pos);
        inst.status = InstanceStatus::AwaitingAction;
        inst.awaiting = Some(Awaiting::Retrieval {
            correlation_id,
            index: index.to_string(),
        });
    }
}

fn candidates_from(results: Option<&Value>) -> Vec<Candidate> {
    results
        .and_then(Value::as_list)
        .unwrap_or(&[])
        .iter()
        .filter_map(|hit| {
            let text = hit.get("text")?.as_str()?;
            let form = hit.get("meta")?.get("canonical_form")?.as_str()?;
            Some(Candidate {
                text: text.to_string(),
                canonical_form: form.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ast::{FlowDefinition, Statement};
    use crate::flow::builder::build_flow_set;
    use crate::flow::pattern::EventPattern;
    use crate::flow::value::map_value;
    use chrono::Utc;
    use uuid::Uuid;

    fn interpreter(defs: Vec<FlowDefinition>) -> Interpreter {
        Interpreter::new(Arc::new(build_flow_set(&defs).unwrap()), 100)
    }

    fn event(state: &mut ConversationState, draft: EventDraft) -> Event {
        Event {
            id: state.mint_event_id(),
            event_type: draft.event_type,
            payload: draft.payload,
            source: "test".into(),
            created_at: Utc::now(),
        }
    }

    fn user_said(state: &mut ConversationState, text: &str) -> Event {
        event(state, EventDraft::new(kinds::USER_SAID).with("text", text))
    }

    fn on_user_said(name: &str, body: Vec<Statement>) -> FlowDefinition {
        let mut full = vec![Statement::matching(
            EventPattern::new(kinds::USER_SAID).capture("text", "text"),
        )];
        full.extend(body);
        FlowDefinition::new(name, full)
    }

    fn types(drafts: &[EventDraft]) -> Vec<&str> {
        drafts.iter().map(|d| d.event_type.as_str()).collect()
    }

    #[test]
    fn entry_match_spawns_and_emits() {
        let interp = interpreter(vec![on_user_said("echo", vec![Statement::say("You said $text")])]);
        let mut state = ConversationState::new(Uuid::from_u128(1));
        let input = user_said(&mut state, "hi");

        let out = interp.tick(&mut state, &input);
        assert_eq!(types(&out), vec![kinds::FLOW_STARTED, kinds::BOT_SAY]);
        assert_eq!(out[1].get_str("text"), Some("You said hi"));
        assert_eq!(state.instances[0].status, InstanceStatus::Advancing);
    }

    #[test]
    fn higher_priority_decides_first_and_loser_waits() {
        let interp = interpreter(vec![
            on_user_said("low", vec![Statement::say("low")]),
            on_user_said("high", vec![Statement::say("high")]).with_priority(2.0),
        ]);
        let mut state = ConversationState::new(Uuid::from_u128(2));
        let input = user_said(&mut state, "x");

        let out = interp.tick(&mut state, &input);
        let says: Vec<_> = out.iter().filter(|d| d.is(kinds::BOT_SAY)).collect();
        assert_eq!(says.len(), 1);
        assert_eq!(says[0].get_str("text"), Some("high"));

        // the loser takes the next decision
        let next = event(&mut state, out[2].clone());
        let out = interp.tick(&mut state, &next);
        let says: Vec<_> = out.iter().filter(|d| d.is(kinds::BOT_SAY)).collect();
        assert_eq!(says[0].get_str("text"), Some("low"));
    }

    #[test]
    fn extension_winner_interrupts_lower_priority() {
        let interp = interpreter(vec![
            on_user_said("default", vec![Statement::say("default response")]),
            on_user_said("moderation", vec![Statement::say("moderated response")])
                .with_priority(2.0)
                .extension(),
        ]);
        let mut state = ConversationState::new(Uuid::from_u128(3));
        let input = user_said(&mut state, "anything");

        let out = interp.tick(&mut state, &input);
        let aborted = out.iter().find(|d| d.is(kinds::FLOW_ABORTED)).unwrap();
        assert_eq!(aborted.get_str("flow"), Some("default"));
        assert_eq!(aborted.get_str("reason"), Some("interrupted"));
        assert_eq!(state.instances_of("default").next().unwrap().status, InstanceStatus::Aborted);
    }

    #[test]
    fn equal_priority_prefers_definition_order() {
        let interp = interpreter(vec![
            on_user_said("first", vec![Statement::say("first")]),
            on_user_said("second", vec![Statement::say("second")]),
        ]);
        let mut state = ConversationState::new(Uuid::from_u128(4));
        let input = user_said(&mut state, "x");
        let out = interp.tick(&mut state, &input);
        let say = out.iter().find(|d| d.is(kinds::BOT_SAY)).unwrap();
        assert_eq!(say.get_str("text"), Some("first"));
    }

    #[test]
    fn action_completion_binds_output() {
        let interp = interpreter(vec![on_user_said(
            "ask",
            vec![
                Statement::execute("lookup")
                    .param("q", Expr::var("text"))
                    .output(Target::context("answer"))
                    .build(),
                Statement::say("Answer: $answer"),
            ],
        )]);
        let mut state = ConversationState::new(Uuid::from_u128(5));
        let input = user_said(&mut state, "capital of France");

        let out = interp.tick(&mut state, &input);
        let started = out.iter().find(|d| d.is(kinds::ACTION_STARTED)).unwrap();
        let correlation = started.get_str("correlation_id").unwrap().to_string();
        assert_eq!(
            started.payload.get("params"),
            Some(&map_value([("q", "capital of France")]))
        );

        let finished = event(
            &mut state,
            EventDraft::new(kinds::ACTION_FINISHED)
                .with("action_name", "lookup")
                .with("correlation_id", correlation)
                .with("status", "success")
                .with("return_value", "Paris"),
        );
        let out = interp.tick(&mut state, &finished);
        let say = out.iter().find(|d| d.is(kinds::BOT_SAY)).unwrap();
        assert_eq!(say.get_str("text"), Some("Answer: Paris"));
        assert_eq!(state.context.get("answer"), Some(&Value::from("Paris")));
    }

    #[test]
    fn unknown_correlation_ids_are_ignored() {
        let interp = interpreter(vec![on_user_said("noop", vec![Statement::Return])]);
        let mut state = ConversationState::new(Uuid::from_u128(6));
        let stray = event(
            &mut state,
            EventDraft::new(kinds::ACTION_FINISHED)
                .with("correlation_id", "act_missing")
                .with("status", "success"),
        );
        assert!(interp.tick(&mut state, &stray).is_empty());
    }

    #[test]
    fn undefined_variable_aborts_only_that_instance() {
        let interp = interpreter(vec![
            on_user_said("broken", vec![Statement::say("Hi $nobody")]).parallel(),
            on_user_said("fine", vec![Statement::say("fine")]),
        ]);
        let mut state = ConversationState::new(Uuid::from_u128(7));
        let input = user_said(&mut state, "x");

        let out = interp.tick(&mut state, &input);
        assert!(out.iter().any(|d| d.is(kinds::FLOW_ERROR)));
        let say = out.iter().find(|d| d.is(kinds::BOT_SAY)).unwrap();
        assert_eq!(say.get_str("text"), Some("fine"));
    }

    #[test]
    fn runaway_loops_hit_the_step_limit() {
        let interp = interpreter(vec![on_user_said(
            "spin",
            vec![Statement::While {
                condition: Expr::lit(true),
                body: vec![Statement::assign(Target::local("x"), Expr::lit(1))],
            }],
        )]);
        let mut state = ConversationState::new(Uuid::from_u128(8));
        let input = user_said(&mut state, "x");

        let out = interp.tick(&mut state, &input);
        let aborted = out.iter().find(|d| d.is(kinds::FLOW_ABORTED)).unwrap();
        assert_eq!(aborted.get_str("reason"), Some("step_limit"));
    }

    #[test]
    fn stale_instances_are_dropped_and_the_event_still_runs() {
        let interp = interpreter(vec![on_user_said("reply", vec![Statement::say("hello back")])]);
        let mut state = ConversationState::new(Uuid::from_u128(9));
        for name in ["old_name", "older_name"] {
            let mut inst = FlowInstance::new(state.mint_instance_id(), 0, name);
            inst.status = InstanceStatus::ActiveMatching;
            state.instances.push(inst);
        }
        assert!(matches!(
            interp.validate_state(&state).unwrap_err(),
            InterpreterError::UnknownFlow { .. }
        ));

        let input = user_said(&mut state, "hi");
        let out = interp.tick(&mut state, &input);

        assert_eq!(out.iter().filter(|d| d.is(kinds::INTERNAL_ERROR)).count(), 2);
        let aborted: Vec<_> = out
            .iter()
            .filter(|d| d.is(kinds::FLOW_ABORTED))
            .map(|d| d.get_str("reason"))
            .collect();
        assert_eq!(aborted, vec![Some("internal"), Some("internal")]);
        let say = out.iter().find(|d| d.is(kinds::BOT_SAY)).unwrap();
        assert_eq!(say.get_str("text"), Some("hello back"));
        assert!(interp.validate_state(&state).is_ok());
    }
}
