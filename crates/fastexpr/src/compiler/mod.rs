//! Compiler driver.
//!
//! Runs analysis, closure materialisation and emission for one tree and
//! links the result into a [`CompiledArtifact`]. The driver never fails on
//! unsupported input: it returns [`NotSupported`], and
//! [`Compiler::compile_or_fallback`] turns that into an interpreted
//! function over the same tree.

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use fastexpr_config::CompilerConfig;
use tracing::{debug, info, trace};

use crate::analyze::analyze;
use crate::closure::{ClosureInfo, ClosureLayout, ClosureStrategy, ClosureValue, NestedLambda};
use crate::emit::{emit_unit, CodeUnit};
use crate::error::NotSupported;
use crate::eval;
use crate::jit;
use crate::node::{ExpressionNode, Param, Shape};
use crate::types::{FuncSig, Type};
use crate::value::ops::plan_conversion;
use crate::value::{Callable, Thrown, Value};

/// The callable type a caller asks for.
#[derive(Debug, Clone)]
pub enum Requested {
    /// Whatever the tree produces.
    Unconstrained,
    /// Exact parameter types; the tree's result must convert to `ret`
    /// without a runtime step.
    Signature(FuncSig),
}

/// Pipeline position of one unit, traced as it advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Analyzing,
    Analyzed,
    Materializing,
    Emitting,
    Emitted,
    Linked,
    Failed,
}

/// A linked compiled unit.
#[derive(Clone)]
pub enum CompiledArtifact {
    /// No captures.
    Bare(Arc<CodeUnit>),
    /// Root unit paired with its closure.
    Bound {
        unit: Arc<CodeUnit>,
        closure: ClosureValue,
    },
    /// Nested unit whose closure is built by the enclosing unit.
    Curryable {
        unit: Arc<CodeUnit>,
        layout: Arc<ClosureLayout>,
    },
}

impl CompiledArtifact {
    pub fn unit(&self) -> &Arc<CodeUnit> {
        match self {
            CompiledArtifact::Bare(unit)
            | CompiledArtifact::Bound { unit, .. }
            | CompiledArtifact::Curryable { unit, .. } => unit,
        }
    }

    pub fn closure(&self) -> Option<&ClosureValue> {
        match self {
            CompiledArtifact::Bound { closure, .. } => Some(closure),
            _ => None,
        }
    }

    pub fn closure_strategy(&self) -> Option<ClosureStrategy> {
        match self {
            CompiledArtifact::Bare(_) => None,
            CompiledArtifact::Bound { closure, .. } => Some(closure.strategy()),
            CompiledArtifact::Curryable { layout, .. } => Some(layout.strategy()),
        }
    }

    pub fn is_native(&self) -> bool {
        self.unit().is_native()
    }

    /// Calls the artifact. A curryable artifact takes its closure as an
    /// explicit first argument.
    ///
    /// # Errors
    ///
    /// Returns the exception the computation threw.
    pub fn invoke(&self, args: &[Value]) -> Result<Value, Thrown> {
        match self {
            CompiledArtifact::Bare(unit) => crate::vm::invoke(unit, None, args),
            CompiledArtifact::Bound { unit, closure } => {
                crate::vm::invoke(unit, Some(closure), args)
            }
            CompiledArtifact::Curryable { unit, .. } => match args.split_first() {
                Some((Value::Closure(closure), rest)) => {
                    crate::vm::invoke(unit, Some(closure), rest)
                }
                _ => Err(Thrown::invalid_operation(format!(
                    "{} expects its closure as the first argument",
                    unit.name()
                ))),
            },
        }
    }

    /// The artifact as a first-class function value, unless it still
    /// needs a closure.
    pub fn to_callable(&self) -> Option<Callable> {
        match self {
            CompiledArtifact::Bare(unit) => Some(Callable::Code {
                unit: unit.clone(),
                closure: None,
            }),
            CompiledArtifact::Bound { unit, closure } => Some(Callable::Code {
                unit: unit.clone(),
                closure: Some(closure.clone()),
            }),
            CompiledArtifact::Curryable { .. } => None,
        }
    }

    /// Binds a curryable artifact to a closure built for its layout.
    ///
    /// # Panics
    ///
    /// Panics if the closure does not fit the layout.
    pub fn bind(&self, closure: ClosureValue) -> Option<Callable> {
        let CompiledArtifact::Curryable { unit, layout } = self else {
            return None;
        };
        assert_eq!(
            closure.len(),
            layout.len(),
            "closure layout mismatch: binding {} items to a layout of {}",
            closure.len(),
            layout.len()
        );
        Some(Callable::Code {
            unit: unit.clone(),
            closure: Some(closure),
        })
    }

    /// The value stored for this artifact in an enclosing closure.
    pub(crate) fn item_value(&self) -> Value {
        match self {
            CompiledArtifact::Curryable { unit, .. } => Value::Code(unit.clone()),
            other => Value::Func(
                other
                    .to_callable()
                    .expect("only curryable artifacts lack a callable form"),
            ),
        }
    }
}

impl fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            CompiledArtifact::Bare(_) => "Bare",
            CompiledArtifact::Bound { .. } => "Bound",
            CompiledArtifact::Curryable { .. } => "Curryable",
        };
        f.debug_struct(kind)
            .field("unit", &self.unit().name())
            .field("closure", &self.closure_strategy())
            .field("native", &self.is_native())
            .finish()
    }
}

/// A compiled artifact or, when the compiler declined, the interpreter
/// running the same tree.
#[derive(Clone)]
pub enum Function {
    Compiled(CompiledArtifact),
    Interpreted(Callable),
}

impl Function {
    pub fn invoke(&self, args: &[Value]) -> Result<Value, Thrown> {
        match self {
            Function::Compiled(artifact) => artifact.invoke(args),
            Function::Interpreted(callable) => callable.call(args),
        }
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self, Function::Compiled(_))
    }

    pub fn artifact(&self) -> Option<&CompiledArtifact> {
        match self {
            Function::Compiled(artifact) => Some(artifact),
            Function::Interpreted(_) => None,
        }
    }

    pub fn to_callable(&self) -> Option<Callable> {
        match self {
            Function::Compiled(artifact) => artifact.to_callable(),
            Function::Interpreted(callable) => Some(callable.clone()),
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Function::Compiled(artifact) => f.debug_tuple("Compiled").field(artifact).finish(),
            Function::Interpreted(_) => f.write_str("Interpreted"),
        }
    }
}

/// Expression compiler.
///
/// Holds configuration only; one instance may compile any number of trees,
/// from any number of threads.
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    config: CompilerConfig,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Compiles `body` as a root unit over `params`.
    ///
    /// # Errors
    ///
    /// Returns [`NotSupported`] if the tree has no compiled form, does not
    /// fit `requested`, or references a parameter nothing declares.
    pub fn compile<N: ExpressionNode>(
        &self,
        body: &N,
        params: &[Param],
        requested: &Requested,
    ) -> Result<CompiledArtifact, NotSupported> {
        self.compile_root("root", body, params, requested)
    }

    /// Compiles a lambda node as a root unit with the lambda's signature.
    pub fn compile_lambda<N: ExpressionNode>(
        &self,
        lambda: &N,
    ) -> Result<CompiledArtifact, NotSupported> {
        let Shape::Lambda { params, body, name } = lambda.shape() else {
            return Err(NotSupported::construct(format!(
                "{:?} is not a lambda",
                lambda.kind()
            )));
        };
        let requested = match lambda.ty().signature() {
            Some(sig) => Requested::Signature(sig.clone()),
            None => Requested::Unconstrained,
        };
        self.compile_root(name.as_deref().unwrap_or("lambda"), &body, &params, &requested)
    }

    /// Compiles a lambda node, falling back to the interpreter when the
    /// compiler declines and the configuration allows it.
    ///
    /// # Errors
    ///
    /// Returns the reason the compiler declined when no fallback is
    /// available.
    pub fn compile_or_fallback<N: ExpressionNode>(
        &self,
        lambda: &N,
    ) -> Result<Function, NotSupported> {
        match self.compile_lambda(lambda) {
            Ok(artifact) => Ok(Function::Compiled(artifact)),
            Err(reason) if self.config.fallback.enabled => {
                debug!(event = "fallback", reason = %reason);
                eval::interpret_lambda(&lambda.to_expr())
                    .map(Function::Interpreted)
                    .ok_or(reason)
            }
            Err(reason) => Err(reason),
        }
    }

    /// Runs closure analysis alone.
    pub fn analyze<N: ExpressionNode>(
        &self,
        body: &N,
        params: &[Param],
    ) -> Result<ClosureInfo, NotSupported> {
        analyze(self, body, params)
    }

    fn compile_root<N: ExpressionNode>(
        &self,
        name: &str,
        body: &N,
        params: &[Param],
        requested: &Requested,
    ) -> Result<CompiledArtifact, NotSupported> {
        let ret = requested_return(body.ty(), params, requested).inspect_err(|reason| {
            debug!(event = "decline", unit = name, reason = %reason);
        })?;
        let info = self.run_analysis(name, body, params)?;
        if let Some(param) = info.params().first() {
            stage(name, Stage::Failed);
            let reason = NotSupported::InvalidCapture {
                name: param.name().to_string(),
            };
            debug!(event = "decline", unit = name, reason = %reason);
            return Err(reason);
        }
        let (unit, layout) = self.link(name, body, params, &ret, &info, true)?;
        Ok(match layout {
            None => CompiledArtifact::Bare(unit),
            Some(layout) => CompiledArtifact::Bound {
                closure: info.materialize(&layout),
                unit,
            },
        })
    }

    /// Compiles a lambda found inside another unit's tree. Its captures stay
    /// unresolved; the enclosing unit supplies them.
    pub(crate) fn compile_nested<N: ExpressionNode>(
        &self,
        lambda: &N,
    ) -> Result<Arc<NestedLambda>, NotSupported> {
        let (Shape::Lambda { params, body, name }, Some(sig)) =
            (lambda.shape(), lambda.ty().signature())
        else {
            return Err(NotSupported::construct(format!(
                "lambda typed {}",
                lambda.ty()
            )));
        };
        let sig = Arc::new(sig.clone());
        let name = name.as_deref().unwrap_or("lambda").to_string();
        if body.ty().is_void() && !sig.ret.is_void() {
            return Err(NotSupported::construct(format!(
                "{name} returns void but is typed {sig}"
            )));
        }
        let info = self.run_analysis(&name, &body, &params)?;
        let (unit, layout) = self.link(&name, &body, &params, &sig.ret, &info, false)?;
        let artifact = match layout {
            None => CompiledArtifact::Bare(unit),
            Some(layout) => CompiledArtifact::Curryable { unit, layout },
        };
        Ok(Arc::new(NestedLambda {
            node: lambda.id(),
            artifact,
            info: (!info.is_empty()).then_some(info),
            sig,
        }))
    }

    fn run_analysis<N: ExpressionNode>(
        &self,
        name: &str,
        body: &N,
        params: &[Param],
    ) -> Result<ClosureInfo, NotSupported> {
        stage(name, Stage::Analyzing);
        match analyze(self, body, params) {
            Ok(info) => {
                stage(name, Stage::Analyzed);
                Ok(info)
            }
            Err(reason) => {
                stage(name, Stage::Failed);
                debug!(event = "decline", unit = name, reason = %reason);
                Err(reason)
            }
        }
    }

    fn link<N: ExpressionNode>(
        &self,
        name: &str,
        body: &N,
        params: &[Param],
        ret: &Type,
        info: &ClosureInfo,
        root: bool,
    ) -> Result<(Arc<CodeUnit>, Option<Arc<ClosureLayout>>), NotSupported> {
        let layout = (!info.is_empty()).then(|| {
            stage(name, Stage::Materializing);
            Arc::new(ClosureLayout::new(info, self.config.closure.fixed_field_limit))
        });

        stage(name, Stage::Emitting);
        let mut unit = match emit_unit(name, body, params, ret, info, layout.clone()) {
            Ok(unit) => unit,
            Err(reason) => {
                stage(name, Stage::Failed);
                debug!(event = "decline", unit = name, reason = %reason);
                return Err(reason);
            }
        };
        stage(name, Stage::Emitted);

        if self.config.verify_emitted_code() || (root && self.config.verify_root_units()) {
            if let Err(problem) = unit.verify() {
                panic!("emitted unit {name} is malformed: {problem}\n{unit:?}");
            }
        }
        if self.config.native.enabled && layout.is_none() {
            if let Some(native) = jit::compile_unit(&unit, self.config.native.max_instructions) {
                info!(event = "native_install", unit = name, instructions = unit.instrs().len());
                unit.install_native(native);
            }
        }

        debug!(
            event = "compile",
            unit = name,
            arity = params.len(),
            closure = ?layout.as_ref().map(|l| l.strategy()),
            items = info.len(),
            instructions = unit.instrs().len(),
        );
        stage(name, Stage::Linked);
        Ok((Arc::new(unit), layout))
    }
}

fn stage(unit: &str, stage: Stage) {
    trace!(event = "stage", unit, stage = ?stage);
}

/// Checks `requested` against the tree and returns the unit's return type.
fn requested_return(
    body: &Type,
    params: &[Param],
    requested: &Requested,
) -> Result<Type, NotSupported> {
    let Requested::Signature(sig) = requested else {
        return Ok(body.clone());
    };
    if sig.params.len() != params.len() {
        return Err(NotSupported::construct(format!(
            "requested {sig} for a tree with {} parameters",
            params.len()
        )));
    }
    if let Some((want, param)) = sig
        .params
        .iter()
        .zip(params)
        .find(|(want, param)| *want != param.ty())
    {
        return Err(NotSupported::construct(format!(
            "parameter {} is {}, requested {want}",
            param.name(),
            param.ty()
        )));
    }
    let fits = sig.ret.is_void()
        || plan_conversion(body, &sig.ret, false).is_some_and(|steps| steps.is_empty());
    if !fits || (body.is_void() && !sig.ret.is_void()) {
        return Err(NotSupported::construct(format!(
            "tree of type {body} does not produce {}",
            sig.ret
        )));
    }
    Ok(sig.ret.clone())
}
