//! Execution context and executor.
//!
//! A single mutable namespace survives across submissions — agents build
//! scenes iteratively, so bindings from one fragment must be visible to the
//! next. Code runs as the scene DSL; constructors register items in the
//! scene manager, and newly created items are annotated with the variable
//! names that ended up bound to them.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::RioConfig;
use crate::exec::parser::{self, BinOp, Expr, Stmt, StmtKind};
use crate::exec::value::Value;
use crate::scene::item::{ItemKind, SceneItem};
use crate::scene::manager::SceneManager;

/// Item constructors the DSL exposes.
const CONSTRUCTORS: &[&str] = &["rect", "ellipse", "line", "text", "label", "widget"];

pub fn is_constructor(name: &str) -> bool {
    CONSTRUCTORS.contains(&name)
}

/// Result of executing one submission.
#[derive(Debug, Default)]
pub struct ExecOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// Value of the final expression statement, if any.
    pub result: Option<Value>,
    /// Captured `print` output.
    pub stdout: String,
    /// Variable names newly bound to items created by this submission.
    pub widgets_created: Vec<String>,
    /// Item ids registered by this submission.
    pub items_registered: Vec<u64>,
}

/// Persistent namespace plus host references.
pub struct ExecutionContext {
    namespace: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(config: &RioConfig) -> Self {
        let mut namespace = BTreeMap::new();
        namespace.insert("scene_width".to_string(), Value::Int(config.width as i64));
        namespace.insert("scene_height".to_string(), Value::Int(config.height as i64));
        Self { namespace }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.namespace.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.namespace.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.namespace.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.namespace.iter()
    }

    /// JSON view for the `vars` file: `_`-prefixed names and modules are
    /// omitted; non-primitives render as `<TypeName object>`.
    pub fn vars_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.namespace {
            if name.starts_with('_') || matches!(value, Value::Module(_)) {
                continue;
            }
            map.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(map)
    }

    /// Primitive bindings for the `state` envelope / snapshots.
    pub fn primitive_vars(&self) -> BTreeMap<String, serde_json::Value> {
        self.namespace
            .iter()
            .filter(|(name, value)| !name.starts_with('_') && value.is_primitive())
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect()
    }

    /// Whether `name` is bound to a live scene item.
    pub fn binding_is_live_item(&self, name: &str, scene: &SceneManager) -> bool {
        matches!(self.namespace.get(name), Some(Value::Item(id)) if scene.has_item(*id))
    }
}

/// Executes DSL submissions against the shared context and scene.
pub struct Executor {
    pub context: Arc<Mutex<ExecutionContext>>,
    pub scene: Arc<Mutex<SceneManager>>,
}

impl Executor {
    pub fn new(context: Arc<Mutex<ExecutionContext>>, scene: Arc<Mutex<SceneManager>>) -> Self {
        Self { context, scene }
    }

    /// Run one submission. Parse and runtime failures are reported in the
    /// outcome, never panicked or raised — a bad fragment must not poison
    /// the next one.
    pub async fn execute(&self, code: &str) -> ExecOutcome {
        if code.trim().is_empty() {
            return ExecOutcome {
                success: true,
                ..Default::default()
            };
        }

        let stmts = match parser::parse_program(code) {
            Ok(stmts) => stmts,
            Err(e) => {
                return ExecOutcome {
                    success: false,
                    error: Some(e),
                    ..Default::default()
                }
            }
        };

        let mut ctx = self.context.lock().await;
        let mut scene = self.scene.lock().await;

        let mut env = EvalEnv {
            ns: &mut ctx.namespace,
            scene: &mut *scene,
            stdout: String::new(),
            created: Vec::new(),
        };

        let mut last_value: Option<Value> = None;
        let mut error = None;
        for stmt in &stmts {
            match eval_stmt(&mut env, stmt) {
                Ok(value) => last_value = value,
                Err(e) => {
                    error = Some(format!("{e}\n  in: {}", stmt.source));
                    break;
                }
            }
        }

        let stdout = std::mem::take(&mut env.stdout);
        let created = std::mem::take(&mut env.created);

        // Annotate created items with the variable names now bound to them.
        let mut widgets_created = Vec::new();
        for (name, value) in env.ns.iter() {
            if let Value::Item(id) = value {
                if created.contains(id) {
                    widgets_created.push(name.clone());
                    if let Some(item) = env.scene.get_item_mut(*id) {
                        if !item.variables.contains(name) {
                            item.variables.push(name.clone());
                        }
                    }
                }
            }
        }

        debug!(
            statements = stmts.len(),
            created = created.len(),
            failed = error.is_some(),
            "submission executed"
        );

        ExecOutcome {
            success: error.is_none(),
            error,
            result: last_value,
            stdout,
            widgets_created,
            items_registered: created,
        }
    }
}

// ========== Evaluation ==========

struct EvalEnv<'a> {
    ns: &'a mut BTreeMap<String, Value>,
    scene: &'a mut SceneManager,
    stdout: String,
    created: Vec<u64>,
}

fn eval_stmt(env: &mut EvalEnv<'_>, stmt: &Stmt) -> Result<Option<Value>, String> {
    match &stmt.kind {
        StmtKind::Import { module } => {
            env.ns
                .insert(module.clone(), Value::Module(module.clone()));
            Ok(None)
        }
        StmtKind::Assign { name, expr } => {
            let value = eval_expr(env, expr)?;
            env.ns.insert(name.clone(), value);
            Ok(None)
        }
        StmtKind::Expr(expr) => Ok(Some(eval_expr(env, expr)?)),
    }
}

fn eval_expr(env: &mut EvalEnv<'_>, expr: &Expr) -> Result<Value, String> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Int(n) => Ok(Value::Int(*n)),
        Expr::Float(f) => Ok(Value::Float(*f)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Ident(name) => env
            .ns
            .get(name)
            .cloned()
            .ok_or_else(|| format!("NameError: name '{name}' is not defined")),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_expr(env, item)?);
            }
            Ok(Value::List(out))
        }
        Expr::Neg(inner) => match eval_expr(env, inner)? {
            Value::Int(n) => Ok(Value::Int(-n)),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(format!(
                "TypeError: bad operand type for unary -: '{}'",
                other.type_name()
            )),
        },
        Expr::Bin { op, lhs, rhs } => {
            let l = eval_expr(env, lhs)?;
            let r = eval_expr(env, rhs)?;
            eval_binop(*op, l, r)
        }
        Expr::Call { func, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(env, arg)?);
            }
            call_builtin(env, func, values)
        }
        Expr::Method { target, name, args } => {
            let recv = eval_expr(env, target)?;
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(env, arg)?);
            }
            call_method(env, recv, name, values)
        }
    }
}

fn eval_binop(op: BinOp, l: Value, r: Value) -> Result<Value, String> {
    use Value::*;
    match (op, &l, &r) {
        (BinOp::Add, Str(a), Str(b)) => return Ok(Str(format!("{a}{b}"))),
        (BinOp::Add, List(a), List(b)) => {
            let mut out = a.clone();
            out.extend(b.clone());
            return Ok(List(out));
        }
        _ => {}
    }

    let (a, b) = match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(format!(
                "TypeError: unsupported operand types: '{}' and '{}'",
                l.type_name(),
                r.type_name()
            ))
        }
    };

    // Integer arithmetic stays integral except for division.
    let both_int = matches!((&l, &r), (Int(_), Int(_)));
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err("ZeroDivisionError: division by zero".to_string());
            }
            return Ok(Float(a / b));
        }
    };
    if both_int {
        Ok(Int(result as i64))
    } else {
        Ok(Float(result))
    }
}

fn need_f64(values: &[Value], idx: usize, func: &str) -> Result<f64, String> {
    values
        .get(idx)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("TypeError: {func}() argument {} must be a number", idx + 1))
}

fn call_builtin(env: &mut EvalEnv<'_>, func: &str, args: Vec<Value>) -> Result<Value, String> {
    match func {
        "print" => {
            let line: Vec<String> = args.iter().map(Value::display).collect();
            env.stdout.push_str(&line.join(" "));
            env.stdout.push('\n');
            Ok(Value::Null)
        }
        "repr" => match args.first() {
            Some(v) => Ok(Value::Str(v.repr())),
            None => Err("TypeError: repr() takes exactly one argument".to_string()),
        },
        "str" => match args.first() {
            Some(v) => Ok(Value::Str(v.display())),
            None => Ok(Value::Str(String::new())),
        },
        "len" => match args.first() {
            Some(Value::Str(s)) => Ok(Value::Int(s.chars().count() as i64)),
            Some(Value::List(items)) => Ok(Value::Int(items.len() as i64)),
            Some(other) => Err(format!(
                "TypeError: object of type '{}' has no len()",
                other.type_name()
            )),
            None => Err("TypeError: len() takes exactly one argument".to_string()),
        },
        "rect" | "ellipse" => {
            let kind = if func == "rect" {
                ItemKind::Rect
            } else {
                ItemKind::Ellipse
            };
            let x = need_f64(&args, 0, func)?;
            let y = need_f64(&args, 1, func)?;
            let w = need_f64(&args, 2, func)?;
            let h = need_f64(&args, 3, func)?;
            Ok(register(env, SceneItem::new(kind, x, y, w, h)))
        }
        "line" => {
            let x1 = need_f64(&args, 0, func)?;
            let y1 = need_f64(&args, 1, func)?;
            let x2 = need_f64(&args, 2, func)?;
            let y2 = need_f64(&args, 3, func)?;
            Ok(register(
                env,
                SceneItem::new(ItemKind::Line, x1, y1, x2 - x1, y2 - y1),
            ))
        }
        "text" | "label" => {
            let kind = if func == "text" {
                ItemKind::Text
            } else {
                ItemKind::Label
            };
            let content = match args.first() {
                Some(Value::Str(s)) => s.clone(),
                Some(other) => other.display(),
                None => return Err(format!("TypeError: {func}() needs a content argument")),
            };
            let x = args.get(1).and_then(Value::as_f64).unwrap_or(0.0);
            let y = args.get(2).and_then(Value::as_f64).unwrap_or(0.0);
            Ok(register(
                env,
                SceneItem::new(kind, x, y, 0.0, 0.0).with_text(content),
            ))
        }
        "widget" => {
            let name = match args.first() {
                Some(Value::Str(s)) => s.clone(),
                _ => return Err("TypeError: widget() needs a kind name".to_string()),
            };
            let x = args.get(1).and_then(Value::as_f64).unwrap_or(0.0);
            let y = args.get(2).and_then(Value::as_f64).unwrap_or(0.0);
            let w = args.get(3).and_then(Value::as_f64).unwrap_or(200.0);
            let h = args.get(4).and_then(Value::as_f64).unwrap_or(150.0);
            Ok(register(
                env,
                SceneItem::new(ItemKind::Widget, x, y, w, h).with_text(name),
            ))
        }
        other => Err(format!("NameError: function '{other}' is not defined")),
    }
}

fn register(env: &mut EvalEnv<'_>, item: SceneItem) -> Value {
    let id = env.scene.register_item(item);
    env.created.push(id);
    Value::Item(id)
}

fn call_method(
    env: &mut EvalEnv<'_>,
    recv: Value,
    name: &str,
    args: Vec<Value>,
) -> Result<Value, String> {
    let id = match recv {
        Value::Item(id) => id,
        other => {
            return Err(format!(
                "AttributeError: '{}' object has no method '{name}'",
                other.type_name()
            ))
        }
    };

    if name == "remove" {
        env.scene.remove_item(id);
        return Ok(Value::Null);
    }

    let item = env
        .scene
        .get_item_mut(id)
        .ok_or_else(|| format!("RuntimeError: item {id} no longer exists"))?;

    match name {
        "set_pos" => {
            item.x = need_f64(&args, 0, name)?;
            item.y = need_f64(&args, 1, name)?;
        }
        "set_size" => {
            item.width = need_f64(&args, 0, name)?;
            item.height = need_f64(&args, 1, name)?;
        }
        "set_z" => item.z = need_f64(&args, 0, name)?,
        "set_opacity" => item.opacity = need_f64(&args, 0, name)?.clamp(0.0, 1.0),
        "set_visible" => {
            item.visible = matches!(args.first(), Some(Value::Bool(true)));
        }
        "set_color" => match args.first() {
            Some(Value::Str(color)) => item.color = color.clone(),
            _ => return Err("TypeError: set_color() needs a color string".to_string()),
        },
        "set_text" => match args.first() {
            Some(v) => item.text = Some(v.display()),
            None => return Err("TypeError: set_text() needs an argument".to_string()),
        },
        other => {
            return Err(format!(
                "AttributeError: 'SceneItem' object has no method '{other}'"
            ))
        }
    }
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> Executor {
        let config = RioConfig::default();
        Executor::new(
            Arc::new(Mutex::new(ExecutionContext::new(&config))),
            Arc::new(Mutex::new(SceneManager::new(&config))),
        )
    }

    #[tokio::test]
    async fn print_captures_stdout_and_result_is_null() {
        let ex = executor();
        let out = ex.execute("x = 1\nprint(x)\n").await;
        assert!(out.success);
        assert_eq!(out.stdout, "1\n");
        assert_eq!(out.result, Some(Value::Null));
    }

    #[tokio::test]
    async fn bindings_persist_across_submissions() {
        let ex = executor();
        assert!(ex.execute("x = 41").await.success);
        let out = ex.execute("x + 1").await;
        assert!(out.success);
        assert_eq!(out.result, Some(Value::Int(42)));
    }

    #[tokio::test]
    async fn constructor_registers_item_and_annotates_variable() {
        let ex = executor();
        let out = ex.execute("box = rect(10, 10, 50, 50)").await;
        assert!(out.success);
        assert_eq!(out.items_registered.len(), 1);
        assert_eq!(out.widgets_created, vec!["box"]);

        let scene = ex.scene.lock().await;
        let item = scene.get_item(out.items_registered[0]).unwrap();
        assert_eq!(item.variables, vec!["box"]);
        assert_eq!(item.width, 50.0);
    }

    #[tokio::test]
    async fn methods_mutate_items() {
        let ex = executor();
        ex.execute("b = rect(0, 0, 10, 10)").await;
        let out = ex
            .execute("b.set_pos(5, 6)\nb.set_color('#FF0000')\n")
            .await;
        assert!(out.success, "{:?}", out.error);
        let scene = ex.scene.lock().await;
        let item = scene.items().next().unwrap();
        assert_eq!((item.x, item.y), (5.0, 6.0));
        assert_eq!(item.color, "#FF0000");
    }

    #[tokio::test]
    async fn failure_reports_error_and_preserves_namespace() {
        let ex = executor();
        ex.execute("x = 1").await;
        let out = ex.execute("y = missing + 1").await;
        assert!(!out.success);
        assert!(out.error.as_ref().unwrap().contains("NameError"));

        // Next submission still sees x and still works.
        let ok = ex.execute("x + 1").await;
        assert!(ok.success);
        assert_eq!(ok.result, Some(Value::Int(2)));
    }

    #[tokio::test]
    async fn division_semantics() {
        let ex = executor();
        assert_eq!(
            ex.execute("7 / 2").await.result,
            Some(Value::Float(3.5))
        );
        let err = ex.execute("1 / 0").await;
        assert!(err.error.unwrap().contains("ZeroDivisionError"));
    }

    #[tokio::test]
    async fn vars_json_filters_modules_and_underscores() {
        let ex = executor();
        ex.execute("import math\nname = 'rio'\n_hidden = 2\nbox = rect(0,0,1,1)")
            .await;
        let ctx = ex.context.lock().await;
        let scene = ex.scene.lock().await;
        let json = ctx.vars_json();
        assert_eq!(json["name"], "rio");
        assert!(json.get("_hidden").is_none());
        assert!(json.get("math").is_none());
        assert_eq!(json["box"], "<SceneItem object>");
        assert!(ctx.binding_is_live_item("box", &scene));
    }
}
