//! Closure analysis.
//!
//! A single depth-first pass over a unit's body that records what the unit
//! needs from a closure: constants that cannot be encoded as immediates,
//! parameters that no enclosing scope of the unit declares, and nested
//! lambdas. Nested lambdas are compiled on the spot; their own captures are
//! promoted into the unit under analysis so they bubble up to whichever
//! ancestor declares them.


use tracing::trace;

use crate::closure::{is_immediate, ClosureInfo, ConstantRecord};
use crate::compiler::Compiler;
use crate::error::NotSupported;
use crate::node::{ExpressionNode, Param, Shape};

/// Analyses `body` as the body of a unit with formal `params`.
///
/// Unresolved parameters are left in the returned info; the caller decides
/// whether that is legal.
///
/// # Errors
///
/// Fails if a nested lambda cannot be compiled.
pub fn analyze<N: ExpressionNode>(
    compiler: &Compiler,
    body: &N,
    params: &[Param],
) -> Result<ClosureInfo, NotSupported> {
    let mut ctx = AnalysisContext {
        compiler,
        params,
        scopes: Vec::new(),
        info: ClosureInfo::new(),
    };
    ctx.walk(body)?;
    debug_assert!(ctx.scopes.is_empty());
    Ok(ctx.info)
}

struct AnalysisContext<'a> {
    compiler: &'a Compiler,
    params: &'a [Param],
    /// Variables declared by enclosing blocks and catch clauses.
    scopes: Vec<Vec<Param>>,
    info: ClosureInfo,
}

impl AnalysisContext<'_> {
    fn is_declared(&self, param: &Param) -> bool {
        self.params.contains(param) || self.scopes.iter().any(|scope| scope.contains(param))
    }

    fn walk<N: ExpressionNode>(&mut self, node: &N) -> Result<(), NotSupported> {
        match node.shape() {
            Shape::Constant(value) => {
                if !is_immediate(&value) {
                    self.info.add_constant(ConstantRecord {
                        node: node.id(),
                        value,
                        ty: node.ty().clone(),
                    });
                }
                Ok(())
            }
            Shape::Parameter(param) => {
                if !self.is_declared(&param) {
                    self.info.add_param(&param);
                }
                Ok(())
            }
            Shape::Lambda { .. } => self.walk_lambda(node),
            Shape::Block { variables, body } => {
                self.scopes.push(variables);
                let walked = body.iter().try_for_each(|statement| self.walk(statement));
                self.scopes.pop();
                walked
            }
            Shape::Try {
                body,
                handlers,
                finally,
            } => {
                self.walk(&body)?;
                for handler in &handlers {
                    // filters read the catch variable before it is bound and
                    // have no compiled form
                    if handler.filter.is_some() {
                        return Err(NotSupported::construct("catch filter"));
                    }
                    self.scopes.push(handler.variable.iter().cloned().collect());
                    let walked = self.walk(&handler.body);
                    self.scopes.pop();
                    walked?;
                }
                match &finally {
                    Some(finally) => self.walk(finally),
                    None => Ok(()),
                }
            }
            shape => shape
                .children()
                .into_iter()
                .try_for_each(|child| self.walk(child)),
        }
    }

    fn walk_lambda<N: ExpressionNode>(&mut self, node: &N) -> Result<(), NotSupported> {
        if self.info.nested_index(node.id()).is_some() {
            return Ok(());
        }
        let nested = self.compiler.compile_nested(node)?;
        if let Some(child) = &nested.info {
            for param in child.params() {
                if !self.is_declared(param) && self.info.add_param(param) {
                    trace!(event = "promote_param", param = param.name());
                }
            }
            for constant in child.constants() {
                if self.info.add_constant(constant.clone()) {
                    trace!(event = "promote_constant", ty = %constant.ty);
                }
            }
            for grandchild in child.nested() {
                if self.info.add_nested(grandchild.clone()) {
                    trace!(event = "promote_lambda", sig = %grandchild.sig);
                }
            }
        }
        self.info.add_nested(nested);
        Ok(())
    }
}
