use std::collections::HashMap;

use super::ast::{FlowDefinition, Statement};
use super::ir::{CompiledFlow, FlowSet, Instruction};
use super::pattern::EventPattern;
use super::{ConfigError, ConfigResult};
use crate::runtime::event::kinds;

/// Validate flow definitions and lower them into a [`FlowSet`].
///
/// Definition order is preserved; it is the tie-break between flows of
/// equal priority.
pub fn build_flow_set(definitions: &[FlowDefinition]) -> ConfigResult<FlowSet> {
    let mut names: HashMap<&str, usize> = HashMap::new();
    for (position, def) in definitions.iter().enumerate() {
        if def.name.trim().is_empty() {
            return Err(ConfigError::EmptyName { position });
        }
        if names.insert(def.name.as_str(), position).is_some() {
            return Err(ConfigError::DuplicateFlow(def.name.clone()));
        }
    }

    let mut flows = Vec::with_capacity(definitions.len());
    for def in definitions {
        flows.push(compile_flow(def, definitions, &names)?);
    }

    tracing::debug!(flows = flows.len(), "compiled flow set");
    Ok(FlowSet::from_compiled(flows))
}

fn compile_flow(
    def: &FlowDefinition,
    all: &[FlowDefinition],
    names: &HashMap<&str, usize>,
) -> ConfigResult<CompiledFlow> {
    if def.body.is_empty() {
        return Err(ConfigError::EmptyBody(def.name.clone()));
    }
    if !def.priority.is_finite() {
        return Err(ConfigError::InvalidPriority {
            flow: def.name.clone(),
            priority: def.priority,
        });
    }
    if !def.flags.subflow && !matches!(def.body.first(), Some(Statement::Match(_))) {
        return Err(ConfigError::MissingEntryMatch(def.name.clone()));
    }

    let mut lowering = Lowering {
        flow: &def.name,
        all,
        names,
        code: Vec::new(),
    };
    lowering.block(&def.body)?;

    Ok(CompiledFlow {
        name: def.name.clone(),
        priority: def.priority,
        flags: def.flags,
        code: lowering.code,
    })
}

struct Lowering<'a> {
    flow: &'a str,
    all: &'a [FlowDefinition],
    names: &'a HashMap<&'a str, usize>,
    code: Vec<Instruction>,
}

impl Lowering<'_> {
    fn invalid(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::InvalidArgument {
            flow: self.flow.to_string(),
            message: message.into(),
        }
    }

    fn resolve_flow(&self, target: &str) -> ConfigResult<usize> {
        self.names
            .get(target)
            .copied()
            .ok_or_else(|| ConfigError::UnknownFlow {
                flow: self.flow.to_string(),
                target: target.to_string(),
            })
    }

    fn pos(&self) -> usize {
        self.code.len()
    }

    fn patch_jump(&mut self, at: usize, target: usize) {
        match &mut self.code[at] {
            Instruction::Jump(dest) | Instruction::JumpUnless { target: dest, .. } => {
                *dest = target;
            }
            _ => unreachable!("patching a non-jump instruction"),
        }
    }

    fn patch_failure(&mut self, at: usize, target: usize) {
        match &mut self.code[at] {
            Instruction::Execute { on_failure, .. }
            | Instruction::GenerateCanonicalForm { on_failure, .. }
            | Instruction::Retrieve { on_failure, .. } => *on_failure = Some(target),
            _ => unreachable!("patching a non-suspending instruction"),
        }
    }

    /// Lay out `instr` followed by an optional failure branch:
    ///
    /// ```text
    /// k    : instr (on_failure -> k+2)
    /// k+1  : jump end
    /// k+2..: failure body
    /// end  :
    /// ```
    fn with_failure_branch(
        &mut self,
        instr: Instruction,
        on_failure: &Option<Vec<Statement>>,
    ) -> ConfigResult<()> {
        let at = self.pos();
        self.code.push(instr);
        if let Some(body) = on_failure {
            let skip = self.pos();
            self.code.push(Instruction::Jump(0));
            let failure_start = self.pos();
            self.block(body)?;
            let end = self.pos();
            self.patch_failure(at, failure_start);
            self.patch_jump(skip, end);
        }
        Ok(())
    }

    fn check_pattern(&self, pattern: &EventPattern) -> ConfigResult<()> {
        if pattern.event_type.trim().is_empty() {
            return Err(self.invalid("match pattern has an empty event type"));
        }
        Ok(())
    }

    fn block(&mut self, statements: &[Statement]) -> ConfigResult<()> {
        for statement in statements {
            self.statement(statement)?;
        }
        Ok(())
    }

    fn statement(&mut self, statement: &Statement) -> ConfigResult<()> {
        match statement {
            Statement::Match(pattern) => {
                self.check_pattern(pattern)?;
                self.code.push(Instruction::Match(pattern.clone()));
            }
            Statement::Execute(exec) => {
                if exec.action.trim().is_empty() {
                    return Err(self.invalid("execute statement has an empty action name"));
                }
                let instr = Instruction::Execute {
                    action: exec.action.clone(),
                    params: exec.params.clone(),
                    output: exec.output.clone(),
                    on_failure: None,
                };
                self.with_failure_branch(instr, &exec.on_failure)?;
            }
            Statement::Emit {
                event_type,
                payload,
            } => {
                if event_type.trim().is_empty() {
                    return Err(self.invalid("emit statement has an empty event type"));
                }
                self.code.push(Instruction::Emit {
                    event_type: event_type.clone(),
                    payload: payload.clone(),
                });
            }
            Statement::Say(text) => {
                self.code.push(Instruction::Emit {
                    event_type: kinds::BOT_SAY.to_string(),
                    payload: [("text".to_string(), text.clone())].into_iter().collect(),
                });
            }
            Statement::Assign { target, value } => {
                self.code.push(Instruction::Assign {
                    target: target.clone(),
                    value: value.clone(),
                });
            }
            Statement::If { arms, otherwise } => {
                if arms.is_empty() {
                    return Err(self.invalid("if statement has no arms"));
                }
                let mut exits = Vec::with_capacity(arms.len());
                for arm in arms {
                    let test = self.pos();
                    self.code.push(Instruction::JumpUnless {
                        condition: arm.condition.clone(),
                        target: 0,
                    });
                    self.block(&arm.body)?;
                    exits.push(self.pos());
                    self.code.push(Instruction::Jump(0));
                    let next_arm = self.pos();
                    self.patch_jump(test, next_arm);
                }
                if let Some(body) = otherwise {
                    self.block(body)?;
                }
                let end = self.pos();
                for exit in exits {
                    self.patch_jump(exit, end);
                }
            }
            Statement::While { condition, body } => {
                let start = self.pos();
                self.code.push(Instruction::JumpUnless {
                    condition: condition.clone(),
                    target: 0,
                });
                self.block(body)?;
                self.code.push(Instruction::Jump(start));
                let end = self.pos();
                self.patch_jump(start, end);
            }
            Statement::Subflow(target) => {
                let idx = self.resolve_flow(target)?;
                if !self.all[idx].flags.subflow {
                    return Err(ConfigError::NotASubflow {
                        flow: self.flow.to_string(),
                        target: target.clone(),
                    });
                }
                self.code.push(Instruction::CallSubflow(idx));
            }
            Statement::Start(target) => {
                let idx = self.resolve_flow(target)?;
                self.code.push(Instruction::StartFlow(idx));
            }
            Statement::GenerateCanonicalForm(generate) => {
                if generate.max_candidates == 0 {
                    return Err(self.invalid("max_candidates must be a positive integer"));
                }
                let instr = Instruction::GenerateCanonicalForm {
                    input: generate.input.clone(),
                    index: generate.index.clone(),
                    max_candidates: generate.max_candidates,
                    chooser: generate.chooser.clone(),
                    output: generate.output.clone(),
                    on_failure: None,
                };
                self.with_failure_branch(instr, &generate.on_failure)?;
            }
            Statement::Retrieve(retrieve) => {
                if retrieve.max_results == 0 {
                    return Err(self.invalid("max_results must be a positive integer"));
                }
                if retrieve.max_distance.is_some_and(|d| !d.is_finite() || d < 0.0) {
                    return Err(self.invalid("max_distance must be a non-negative number"));
                }
                let instr = Instruction::Retrieve {
                    index: retrieve.index.clone(),
                    query: retrieve.query.clone(),
                    max_results: retrieve.max_results,
                    max_distance: retrieve.max_distance,
                    output: retrieve.output.clone(),
                    on_failure: None,
                };
                self.with_failure_branch(instr, &retrieve.on_failure)?;
            }
            Statement::Return => self.code.push(Instruction::Return),
            Statement::Abort => self.code.push(Instruction::Abort),
        }
        Ok(())
    }
}
