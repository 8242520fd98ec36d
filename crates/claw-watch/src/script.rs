//! Starlark interpreter owned by one pool slot.
//!
//! Starlark values are tied to the heap of the module that allocated them and
//! never leave the slot's thread: requests come in as plain [`Value`]s and
//! results go back out the same way.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use starlark::codemap::FileSpanRef;
use starlark::environment::{FrozenModule, Globals, LibraryExtension, Module};
use starlark::eval::{BeforeStmtFuncDyn, Evaluator};
use starlark::syntax::{AstModule, Dialect};
use starlark::values::dict::AllocDict;
use starlark::values::list::AllocList;
use starlark::values::{Heap, Value as StarlarkValue};

use crate::error::{Result, WatchError};
use crate::value::Value;

/// Global the condition script reads and may modify.
pub const RESULT_GLOBAL: &str = "result";
/// Global holding the alert name.
pub const NAME_GLOBAL: &str = "name";
/// Global holding the cycle start in unix seconds.
pub const STARTED_TS_GLOBAL: &str = "started_ts";

/// One condition run, as sent to a slot.
#[derive(Debug, Clone)]
pub(crate) struct EvalRequest {
    pub script: Arc<str>,
    pub name: String,
    pub started_ts: u64,
    pub result: Value,
}

/// What a condition run produced.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EvalOutput {
    pub verdict: bool,
    pub result: Value,
}

/// Checks that `source` parses, without running it.
pub fn check_syntax(filename: &str, source: &str) -> Result<()> {
    parse(filename, source).map(drop)
}

fn parse(filename: &str, source: &str) -> Result<AstModule> {
    AstModule::parse(filename, source.to_owned(), &Dialect::Extended)
        .map_err(|e| WatchError::script(e.to_string()))
}

fn globals() -> Globals {
    Globals::extended_by(&[
        LibraryExtension::Json,
        LibraryExtension::Map,
        LibraryExtension::Filter,
        LibraryExtension::StructType,
    ])
}

/// A slot's interpreter: the builtins plus the frozen init-script helpers.
pub(crate) struct Interpreter {
    globals: Globals,
    helpers: Option<FrozenModule>,
}

impl Interpreter {
    /// Builds the interpreter, running `init_script` once if given.
    pub(crate) fn new(init_script: Option<&str>) -> Result<Self> {
        let globals = globals();
        let helpers = init_script
            .map(|source| run_init(source, &globals))
            .transpose()?;

        Ok(Self { globals, helpers })
    }

    /// Runs one condition script in a fresh module.
    ///
    /// The script stops with an error at its next statement once `cancel` is
    /// set.
    pub(crate) fn run(&self, request: &EvalRequest, cancel: &Arc<AtomicBool>) -> Result<EvalOutput> {
        if cancel.load(Ordering::Acquire) {
            return Err(WatchError::script(CANCELLED));
        }

        let ast = parse(&request.name, &request.script)?;

        let module = Module::new();
        if let Some(helpers) = &self.helpers {
            module.import_public_symbols(helpers);
        }

        let heap = module.heap();
        module.set(NAME_GLOBAL, heap.alloc(request.name.as_str()));
        module.set(
            STARTED_TS_GLOBAL,
            heap.alloc(i64::try_from(request.started_ts).unwrap_or(i64::MAX)),
        );
        module.set(RESULT_GLOBAL, to_starlark(heap, &request.result));

        let verdict = {
            let mut eval = Evaluator::new(&module);
            let check: Box<dyn BeforeStmtFuncDyn> = Box::new(CancelCheck(Arc::clone(cancel)));
            eval.before_stmt_for_dap(check.into());
            let last = eval
                .eval_module(ast, &self.globals)
                .map_err(|e| WatchError::script(e.to_string()))?;
            last.to_bool()
        };

        let result = match module.get(RESULT_GLOBAL) {
            Some(value) => from_starlark(value)?,
            None => Value::Null,
        };

        Ok(EvalOutput { verdict, result })
    }
}

fn run_init(source: &str, globals: &Globals) -> Result<FrozenModule> {
    let init_err = |reason: String| WatchError::PoolInit { reason };

    let ast = AstModule::parse("init.star", source.to_owned(), &Dialect::Extended)
        .map_err(|e| init_err(e.to_string()))?;

    let module = Module::new();
    {
        let mut eval = Evaluator::new(&module);
        eval.eval_module(ast, globals)
            .map_err(|e| init_err(e.to_string()))?;
    }

    module.freeze().map_err(|e| init_err(e.err_msg))
}

const CANCELLED: &str = "evaluation cancelled";

/// Aborts the evaluation before the next statement once the flag is set.
struct CancelCheck(Arc<AtomicBool>);

impl<'a, 'e: 'a> BeforeStmtFuncDyn<'a, 'e> for CancelCheck {
    fn call<'v>(
        &mut self,
        _span: FileSpanRef,
        _eval: &mut Evaluator<'v, 'a, 'e>,
    ) -> starlark::Result<()> {
        if self.0.load(Ordering::Acquire) {
            return Err(starlark::Error::new_other(anyhow::anyhow!(CANCELLED)));
        }
        Ok(())
    }
}

fn to_starlark<'v>(heap: &'v Heap, value: &Value) -> StarlarkValue<'v> {
    match value {
        Value::Null => StarlarkValue::new_none(),
        Value::Bool(b) => StarlarkValue::new_bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => heap.alloc(i),
            None => heap.alloc(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => heap.alloc(s.as_str()),
        Value::List(items) => heap.alloc(AllocList(
            items.iter().map(|item| to_starlark(heap, item)),
        )),
        Value::Map(map) => heap.alloc(AllocDict(
            map.iter().map(|(k, v)| (k.as_str(), to_starlark(heap, v))),
        )),
    }
}

fn from_starlark(value: StarlarkValue<'_>) -> Result<Value> {
    value
        .to_json_value()
        .map(Value::from)
        .map_err(|e| WatchError::script(format!("`{RESULT_GLOBAL}` is not plain data: {e}")))
}
