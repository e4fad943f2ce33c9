//! Security rules applied to a parsed module.

use std::collections::{HashMap, HashSet};

use super::ast::{
    Block, Expr, ExprKind, Stmt, StmtKind, UnaryOp, Visitor, walk_block, walk_expr, walk_stmt,
};
use super::{Location, RuleId, ValidatorSettings, Violation};

/// Modules whose only purpose is loading other modules or reaching the
/// builtins namespace.
const DYNAMIC_IMPORT_MODULES: &[&str] = &["importlib", "imp", "runpy", "pkgutil", "builtins"];

const DYNAMIC_IMPORT_NAMES: &[&str] = &["__import__", "__builtins__", "__loader__", "__spec__"];

const CODE_EVAL_NAMES: &[&str] = &["eval", "exec", "compile", "breakpoint"];

const CODE_EVAL_ATTRS: &[&str] = &["eval", "exec"];

const IO_NAMES: &[&str] = &["open", "input"];

const IO_ATTRS: &[&str] = &[
    "open",
    "to_csv",
    "to_pickle",
    "to_parquet",
    "to_excel",
    "to_json",
    "to_sql",
    "to_hdf",
    "to_feather",
    "to_html",
    "load",
    "save",
    "savez",
    "savez_compressed",
    "loadtxt",
    "savetxt",
    "fromfile",
    "tofile",
    "genfromtxt",
    "memmap",
    "socket",
    "create_connection",
    "urlopen",
    "savemat",
    "loadmat",
    "open_memmap",
    "HDFStore",
    "load_library",
    "loads",
];

/// Submodules of allowed packages that read or write files or load
/// native libraries.
const IO_SUBMODULES: &[&str] = &["scipy.io", "numpy.ctypeslib", "numpy.lib.format", "pandas.io"];

fn is_io_module(module: &str) -> bool {
    IO_SUBMODULES.iter().any(|sub| {
        module
            .strip_prefix(sub)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
    })
}

const REFLECTION_NAMES: &[&str] = &["globals", "locals", "vars"];

const ATTRIBUTE_ACCESSORS: &[&str] = &["getattr", "setattr", "delattr"];

const ALLOWED_DUNDERS: &[&str] = &["__name__", "__doc__", "__version__"];

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

fn is_io_attr(name: &str) -> bool {
    name.starts_with("read_") || IO_ATTRS.contains(&name)
}

fn is_negative(expr: &Expr) -> bool {
    matches!(
        expr.kind,
        ExprKind::Unary {
            op: UnaryOp::Neg,
            ..
        }
    )
}

/// Run every rule over `module`. Violations come back sorted by location.
pub(super) fn check(module: &Block, settings: &ValidatorSettings) -> Vec<Violation> {
    let mut taint = TaintCollector {
        tainted: settings.time_ordered_inputs.iter().cloned().collect(),
    };
    loop {
        let before = taint.tainted.len();
        walk_block(&mut taint, module);
        if taint.tainted.len() == before {
            break;
        }
    }

    let mut imports = ImportAliases::default();
    walk_block(&mut imports, module);

    let mut checker = Checker {
        settings,
        tainted: &taint.tainted,
        aliases: &imports.aliases,
        violations: Vec::new(),
        seen: HashSet::new(),
    };
    walk_block(&mut checker, module);

    let mut violations = checker.violations;
    violations.sort_by(|a, b| {
        (a.location.line, a.location.column, a.rule_id).cmp(&(
            b.location.line,
            b.location.column,
            b.rule_id,
        ))
    });
    violations
}

/// Names holding values derived from a time-ordered input.
struct TaintCollector {
    tainted: HashSet<String>,
}

impl TaintCollector {
    fn derives(&self, expr: &Expr) -> bool {
        match &expr.kind {
            ExprKind::Name(name) => self.tainted.contains(name),
            ExprKind::Attribute { value, .. } | ExprKind::Subscript { value, .. } => {
                self.derives(value)
            }
            ExprKind::Call { func, args } => {
                self.derives(func) || args.iter().any(|arg| self.derives(&arg.value))
            }
            ExprKind::Binary { left, right, .. } => self.derives(left) || self.derives(right),
            ExprKind::Unary { operand, .. } => self.derives(operand),
            ExprKind::IfExp { body, orelse, .. } => self.derives(body) || self.derives(orelse),
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                items.iter().any(|item| self.derives(item))
            }
            ExprKind::BoolOp { values, .. } => values.iter().any(|v| self.derives(v)),
            ExprKind::Starred(inner) | ExprKind::Await(inner) => self.derives(inner),
            ExprKind::NamedExpr { value, .. } => self.derives(value),
            ExprKind::Comprehension {
                element,
                generators,
                ..
            } => self.derives(element) || generators.iter().any(|g| self.derives(&g.iter)),
            _ => false,
        }
    }

    fn bind(&mut self, target: &Expr) {
        match &target.kind {
            ExprKind::Name(name) => {
                self.tainted.insert(name.clone());
            }
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                for item in items {
                    self.bind(item);
                }
            }
            ExprKind::Starred(inner) => self.bind(inner),
            _ => {}
        }
    }
}

impl Visitor for TaintCollector {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Assign { targets, value } if self.derives(value) => {
                for target in targets {
                    self.bind(target);
                }
            }
            StmtKind::AnnAssign {
                target,
                value: Some(value),
                ..
            }
            | StmtKind::AugAssign { target, value, .. }
                if self.derives(value) =>
            {
                self.bind(target);
            }
            StmtKind::For { target, iter, .. } if self.derives(iter) => self.bind(target),
            StmtKind::With { items, .. } => {
                for item in items {
                    if let Some(target) = &item.target
                        && self.derives(&item.context)
                    {
                        self.bind(target);
                    }
                }
            }
            _ => {}
        }
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::NamedExpr { target, value } if self.derives(value) => self.bind(target),
            ExprKind::Comprehension { generators, .. } => {
                for generator in generators {
                    if self.derives(&generator.iter) {
                        self.bind(&generator.target);
                    }
                }
            }
            _ => {}
        }
        walk_expr(self, expr);
    }
}

/// Local names bound by import statements, mapped to the dotted module
/// path they stand for.
#[derive(Default)]
struct ImportAliases {
    aliases: HashMap<String, String>,
}

impl Visitor for ImportAliases {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Import(names) => {
                for alias in names {
                    if let Some(asname) = &alias.asname {
                        self.aliases.insert(asname.clone(), alias.name.clone());
                    }
                }
            }
            StmtKind::ImportFrom {
                module: Some(module),
                level: 0,
                names,
            } => {
                for alias in names {
                    let local = alias.asname.as_ref().unwrap_or(&alias.name);
                    self.aliases
                        .insert(local.clone(), format!("{}.{}", module, alias.name));
                }
            }
            _ => {}
        }
        walk_stmt(self, stmt);
    }
}

struct Checker<'a> {
    settings: &'a ValidatorSettings,
    tainted: &'a HashSet<String>,
    aliases: &'a HashMap<String, String>,
    violations: Vec<Violation>,
    seen: HashSet<(Location, RuleId, String)>,
}

impl Checker<'_> {
    fn report(&mut self, rule_id: RuleId, location: Location, description: String) {
        if self.seen.insert((location, rule_id, description.clone())) {
            self.violations.push(Violation {
                rule_id,
                location,
                description,
            });
        }
    }

    /// Returns whether the module may be imported.
    fn check_module(&mut self, module: &str, loc: Location) -> bool {
        let root = module.split('.').next().unwrap_or(module);
        if DYNAMIC_IMPORT_MODULES.contains(&root) {
            self.report(
                RuleId::NoDynamicImport,
                loc,
                format!("import of `{}` enables dynamic module loading", module),
            );
            false
        } else if !self.settings.allowed_modules.contains(root)
            && !self.settings.allowed_modules.contains(module)
        {
            self.report(
                RuleId::NoForbiddenImport,
                loc,
                format!("module `{}` is not in the allowed module list", module),
            );
            false
        } else if is_io_module(module) {
            self.report(
                RuleId::NoIoHandle,
                loc,
                format!("module `{}` reads and writes host files", module),
            );
            false
        } else {
            true
        }
    }

    /// Names pulled out of an allowed module with `from m import name`.
    fn check_imported_name(&mut self, module: &str, name: &str, loc: Location) {
        if is_io_module(&format!("{}.{}", module, name)) {
            self.report(
                RuleId::NoIoHandle,
                loc,
                format!("import of `{}` from `{}` reads and writes host files", name, module),
            );
        } else if CODE_EVAL_NAMES.contains(&name) {
            self.report(
                RuleId::NoCodeEval,
                loc,
                format!("import of `{}` from `{}`", name, module),
            );
        } else if name == "import_module" || DYNAMIC_IMPORT_NAMES.contains(&name) {
            self.report(
                RuleId::NoDynamicImport,
                loc,
                format!("import of `{}` from `{}`", name, module),
            );
        } else if IO_NAMES.contains(&name) || is_io_attr(name) {
            self.report(
                RuleId::NoIoHandle,
                loc,
                format!("import of I/O helper `{}` from `{}`", name, module),
            );
        } else if is_dunder(name) && !ALLOWED_DUNDERS.contains(&name) {
            self.report(
                RuleId::NoReflection,
                loc,
                format!("import of `{}` from `{}`", name, module),
            );
        }
    }

    fn check_name(&mut self, name: &str, loc: Location) {
        if CODE_EVAL_NAMES.contains(&name) {
            self.report(
                RuleId::NoCodeEval,
                loc,
                format!("reference to `{}` evaluates code at runtime", name),
            );
        } else if DYNAMIC_IMPORT_NAMES.contains(&name) {
            self.report(
                RuleId::NoDynamicImport,
                loc,
                format!("reference to `{}`", name),
            );
        } else if IO_NAMES.contains(&name) {
            self.report(
                RuleId::NoIoHandle,
                loc,
                format!("reference to `{}` acquires a host handle", name),
            );
        } else if REFLECTION_NAMES.contains(&name) {
            self.report(
                RuleId::NoReflection,
                loc,
                format!("reference to `{}` exposes a namespace", name),
            );
        } else if ATTRIBUTE_ACCESSORS.contains(&name) {
            self.report(
                RuleId::NoReflection,
                loc,
                format!("`{}` used outside a direct call", name),
            );
        }
    }

    fn check_attribute(&mut self, attr: &str, loc: Location) {
        if DYNAMIC_IMPORT_NAMES.contains(&attr) || attr == "import_module" {
            self.report(
                RuleId::NoDynamicImport,
                loc,
                format!("access to `.{}`", attr),
            );
        } else if is_dunder(attr) && !ALLOWED_DUNDERS.contains(&attr) {
            self.report(
                RuleId::NoReflection,
                loc,
                format!("access to dunder attribute `.{}`", attr),
            );
        } else if CODE_EVAL_ATTRS.contains(&attr) {
            self.report(
                RuleId::NoCodeEval,
                loc,
                format!("access to `.{}` evaluates code at runtime", attr),
            );
        } else if is_io_attr(attr) {
            self.report(
                RuleId::NoIoHandle,
                loc,
                format!("access to I/O helper `.{}`", attr),
            );
        }
    }

    /// `getattr(obj, "name")` is tolerated only for a literal, ordinary
    /// attribute name on something other than the builtins namespace.
    fn check_accessor_call(&mut self, accessor: &str, args: &[super::ast::Arg], loc: Location) {
        let target = args.first().map(|arg| &arg.value);
        let name = args.get(1).map(|arg| &arg.value);

        if target
            .and_then(Expr::as_name)
            .is_some_and(|n| n == "builtins" || n == "__builtins__")
        {
            self.report(
                RuleId::NoReflection,
                loc,
                format!("`{}` on the builtins namespace", accessor),
            );
            return;
        }

        match name.and_then(Expr::as_str) {
            None => self.report(
                RuleId::NoReflection,
                loc,
                format!("`{}` with a non-literal attribute name", accessor),
            ),
            Some(attr)
                if is_dunder(attr)
                    || CODE_EVAL_NAMES.contains(&attr)
                    || DYNAMIC_IMPORT_NAMES.contains(&attr)
                    || attr == "import_module"
                    || IO_NAMES.contains(&attr)
                    || is_io_attr(attr) =>
            {
                self.report(
                    RuleId::NoReflection,
                    loc,
                    format!("`{}` of restricted attribute `{}`", accessor, attr),
                );
            }
            Some(_) => {}
        }
    }

    /// Dotted module path of a `name.attr.attr` chain, with the root
    /// resolved through import aliases.
    fn module_path(&self, expr: &Expr) -> Option<String> {
        match &expr.kind {
            ExprKind::Name(name) => Some(self.aliases.get(name).unwrap_or(name).clone()),
            ExprKind::Attribute { value, attr } => {
                self.module_path(value).map(|path| format!("{}.{}", path, attr))
            }
            _ => None,
        }
    }

    fn check_submodule_access(&mut self, expr: &Expr) {
        if let Some(path) = self.module_path(expr)
            && IO_SUBMODULES.contains(&path.as_str())
        {
            self.report(
                RuleId::NoIoHandle,
                expr.loc,
                format!("access to `{}` reads and writes host files", path),
            );
        }
    }

    /// Root identifier of `a.b[c].d()`-style chains.
    fn root_name(expr: &Expr) -> Option<&str> {
        match &expr.kind {
            ExprKind::Name(name) => Some(name),
            ExprKind::Attribute { value, .. } | ExprKind::Subscript { value, .. } => {
                Self::root_name(value)
            }
            ExprKind::Call { func, .. } => Self::root_name(func),
            _ => None,
        }
    }

    fn is_time_ordered(&self, expr: &Expr) -> bool {
        Self::root_name(expr).is_some_and(|name| self.tainted.contains(name))
    }

    fn negative_offset_in_index(index: &Expr) -> bool {
        match &index.kind {
            ExprKind::Slice { lower, upper, .. } => [lower, upper]
                .into_iter()
                .flatten()
                .any(|bound| is_negative(bound)),
            ExprKind::Tuple(items) => items.iter().any(Self::negative_offset_in_index),
            _ => is_negative(index),
        }
    }

    fn check_subscript(&mut self, value: &Expr, index: &Expr, loc: Location) {
        if self.is_time_ordered(value) && Self::negative_offset_in_index(index) {
            let name = Self::root_name(value).unwrap_or_default();
            self.report(
                RuleId::NoLookahead,
                loc,
                format!("negative offset applied to time-ordered input `{}`", name),
            );
        }
    }

    fn check_shift_call(&mut self, func: &Expr, args: &[super::ast::Arg], loc: Location) {
        let (receiver, method) = match &func.kind {
            ExprKind::Attribute { value, attr } => (Some(value.as_ref()), attr.as_str()),
            ExprKind::Name(name) => (None, name.as_str()),
            _ => return,
        };

        let offending = match method {
            // series.shift(-n) / series.shift(periods=-n)
            "shift" => {
                receiver.is_some_and(|r| self.is_time_ordered(r))
                    && args.iter().any(|arg| {
                        matches!(arg.name.as_deref(), None | Some("periods"))
                            && is_negative(&arg.value)
                    })
            }
            // np.roll(x, -n) / np.roll(x, shift=-n)
            "roll" => {
                args.first().is_some_and(|arg| self.is_time_ordered(&arg.value))
                    && args.iter().enumerate().any(|(i, arg)| {
                        let is_shift = match arg.name.as_deref() {
                            Some(name) => name == "shift",
                            None => i == 1,
                        };
                        is_shift && is_negative(&arg.value)
                    })
            }
            _ => false,
        };

        if offending {
            self.report(
                RuleId::NoLookahead,
                loc,
                format!("`{}` with a negative offset reads ahead in time", method),
            );
        }
    }
}

impl Visitor for Checker<'_> {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    self.check_module(&alias.name, alias.loc);
                }
            }
            StmtKind::ImportFrom {
                module,
                level,
                names,
            } => {
                if *level > 0 {
                    self.report(
                        RuleId::NoForbiddenImport,
                        stmt.loc,
                        "relative imports are not allowed".to_string(),
                    );
                } else if let Some(module) = module
                    && self.check_module(module, stmt.loc)
                {
                    for alias in names {
                        self.check_imported_name(module, &alias.name, alias.loc);
                    }
                }
            }
            _ => {}
        }
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Name(name) => self.check_name(name, expr.loc),
            ExprKind::Attribute { attr, .. } => {
                self.check_attribute(attr, expr.loc);
                self.check_submodule_access(expr);
            }
            ExprKind::Subscript { value, index } => self.check_subscript(value, index, expr.loc),
            ExprKind::Call { func, args } => {
                self.check_shift_call(func, args, expr.loc);
                if let Some(accessor) = func.as_name()
                    && ATTRIBUTE_ACCESSORS.contains(&accessor)
                {
                    self.check_accessor_call(accessor, args, expr.loc);
                    for arg in args {
                        self.visit_expr(&arg.value);
                    }
                    return;
                }
            }
            _ => {}
        }
        walk_expr(self, expr);
    }
}

#[cfg(test)]
mod tests {
    use super::super::Validator;
    use super::*;

    fn rules(code: &str) -> Vec<RuleId> {
        Validator::default()
            .validate(code)
            .violations
            .into_iter()
            .map(|v| v.rule_id)
            .collect()
    }

    #[test]
    fn test_clean_strategy_passes() {
        let code = r#"
import math
import numpy as np
from statistics import mean
from sandbox_result import emit, params

p = params()
window = int(p.get("window", 20))
closes = np.asarray(prices[:window])
avg = mean(closes)
trend = closes[window - 1] - avg
emit({"position": math.tanh(trend / avg), "avg": float(avg)})
"#;
        assert_eq!(rules(code), Vec::<RuleId>::new());
    }

    #[test]
    fn test_dynamic_import() {
        assert_eq!(rules("import importlib\n"), vec![RuleId::NoDynamicImport]);
        assert_eq!(
            rules("m = __import__('os')\n"),
            vec![RuleId::NoDynamicImport]
        );
        assert_eq!(
            rules("from importlib import import_module\n"),
            vec![RuleId::NoDynamicImport]
        );
        assert!(rules("x = math.__builtins__\n").contains(&RuleId::NoDynamicImport));
    }

    #[test]
    fn test_forbidden_imports() {
        assert_eq!(rules("import os\n"), vec![RuleId::NoForbiddenImport]);
        assert_eq!(
            rules("import subprocess, math\n"),
            vec![RuleId::NoForbiddenImport]
        );
        assert_eq!(
            rules("from . import helpers\n"),
            vec![RuleId::NoForbiddenImport]
        );
        assert!(rules("import numpy.linalg\n").is_empty());
    }

    #[test]
    fn test_code_eval() {
        assert_eq!(rules("eval('1+1')\n"), vec![RuleId::NoCodeEval]);
        assert_eq!(rules("f = exec\n"), vec![RuleId::NoCodeEval]);
        assert_eq!(rules("df.eval('a + b')\n"), vec![RuleId::NoCodeEval]);
        // the reference is caught even inside an f-string field
        assert_eq!(rules("s = f'{eval(x)}'\n"), vec![RuleId::NoCodeEval]);
    }

    #[test]
    fn test_io_handles() {
        assert_eq!(rules("fh = open('/etc/passwd')\n"), vec![RuleId::NoIoHandle]);
        assert_eq!(
            rules("import pandas as pd\nd = pd.read_csv('x.csv')\n"),
            vec![RuleId::NoIoHandle]
        );
        assert_eq!(
            rules("import numpy as np\nnp.load('x.npy')\n"),
            vec![RuleId::NoIoHandle]
        );
        assert_eq!(
            rules("from numpy import fromfile\n"),
            vec![RuleId::NoIoHandle]
        );
        assert_eq!(rules("d = json.loads('{}')\n"), vec![RuleId::NoIoHandle]);
    }

    fn only_io(code: &str) -> bool {
        let found = rules(code);
        !found.is_empty() && found.iter().all(|rule| *rule == RuleId::NoIoHandle)
    }

    #[test]
    fn test_io_submodules() {
        assert!(only_io("import scipy.io
scipy.io.savemat('x.mat', {})
"));
        assert!(only_io("import scipy
m = scipy.io.whosmat
"));
        assert!(only_io("from scipy.io import loadmat
d = loadmat('x.mat')
"));
        assert!(only_io("from scipy import io
"));
        assert!(only_io("import numpy as np
m = np.lib.format.open_memmap('x.npy')
"));
        assert!(only_io("from numpy.lib import format
"));
        assert!(only_io("import pandas as pd
store = pd.HDFStore('x.h5')
"));
        assert!(only_io("import pandas as pd
p = pd.io.parsers
"));
        assert!(only_io("import numpy as np
lib = np.ctypeslib.load_library('m', '.')
"));
        assert!(only_io("import numpy.ctypeslib as nc
"));

        // neighbouring modules stay usable
        assert!(rules("import scipy.stats
z = scipy.stats.zscore(x)
").is_empty());
        assert!(rules("import numpy as np
m = np.linalg.norm(x)
").is_empty());
        assert!(rules("import numpy as np
d = np.iorange
").is_empty());
    }

    #[test]
    fn test_reflection() {
        assert_eq!(
            rules("x = ().__class__.__bases__\n"),
            vec![RuleId::NoReflection, RuleId::NoReflection]
        );
        assert_eq!(rules("g = globals()\n"), vec![RuleId::NoReflection]);
        assert_eq!(
            rules("getattr(obj, name)\n"),
            vec![RuleId::NoReflection]
        );
        assert_eq!(
            rules("getattr(obj, '__class__')\n"),
            vec![RuleId::NoReflection]
        );
        assert_eq!(rules("g = getattr\n"), vec![RuleId::NoReflection]);
        assert!(rules("getattr(stats, 'mean')\n").is_empty());
        assert!(rules("print(__name__)\n").is_empty());
    }

    #[test]
    fn test_lookahead_on_time_ordered_input() {
        assert_eq!(rules("x = prices[-1]\n"), vec![RuleId::NoLookahead]);
        assert_eq!(rules("x = df.close[-3:]\n"), vec![RuleId::NoLookahead]);
        assert_eq!(
            rules("x = data[:, -2]\n"),
            vec![RuleId::NoLookahead]
        );
        assert_eq!(
            rules("future = close.shift(-1)\n"),
            vec![RuleId::NoLookahead]
        );
        assert_eq!(
            rules("future = close.shift(periods=-5)\n"),
            vec![RuleId::NoLookahead]
        );
        assert_eq!(
            rules("import numpy as np\nf = np.roll(prices, -1)\n"),
            vec![RuleId::NoLookahead]
        );
        // lagging is fine
        assert!(rules("past = close.shift(1)\nx = prices[3]\n").is_empty());
        // negative offsets on unrelated sequences are fine
        assert!(rules("names = ['a', 'b']\nlast = names[-1]\n").is_empty());
    }

    #[test]
    fn test_lookahead_follows_derived_names() {
        let code = "\
for row in rows:
    pass
closes = prices
window = closes[10:]
tail = window[-1]
";
        assert_eq!(rules(code), vec![RuleId::NoLookahead]);

        // use before assignment in source order still counts
        let code = "\
def f():
    return series_copy[-1]
series_copy = series
";
        assert_eq!(rules(code), vec![RuleId::NoLookahead]);
    }

    #[test]
    fn test_violations_sorted_and_located() {
        let verdict = Validator::default().validate("x = 1\nimport os\ny = eval('2')\n");
        let locations: Vec<_> = verdict
            .violations
            .iter()
            .map(|v| (v.location.line, v.rule_id))
            .collect();
        assert_eq!(
            locations,
            vec![(2, RuleId::NoForbiddenImport), (3, RuleId::NoCodeEval)]
        );
        assert_eq!(verdict.violations[1].location.column, 5);
    }
}
