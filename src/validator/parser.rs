//! Recursive-descent parser producing the tree in [`super::ast`].
//!
//! Covers the statement and expression grammar generated strategy scripts
//! use. Constructs outside that grammar (`match`, parenthesized
//! with-items, `type` aliases) are reported as syntax errors.

use super::ast::*;
use super::lexer::{self, StrLit, Token, TokenKind};
use super::{Location, ParseError};

/// Nesting limit shared by statements and expressions. One level per
/// block, bracketed group, unary operator or conditional.
const MAX_DEPTH: usize = 100;

/// Bound on the height of one expression tree, counting the links of
/// operator, attribute, call and subscript chains as well as nesting.
/// Verdict rules walk the tree recursively.
const MAX_TREE_HEIGHT: usize = 1000;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import",
    "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while",
    "with", "yield",
];

const AUGMENTED_OPS: &[&str] = &[
    "+=", "-=", "*=", "/=", "//=", "%=", "@=", "&=", "|=", "^=", ">>=", "<<=", "**=",
];

const BINARY_LEVELS: &[&[&str]] = &[
    &["|"],
    &["^"],
    &["&"],
    &["<<", ">>"],
    &["+", "-"],
    &["*", "/", "//", "%", "@"],
];

const COMPOUND_KEYWORDS: &[&str] = &["def", "class", "if", "while", "for", "try", "with", "async"];

type PResult<T> = Result<T, ParseError>;

pub fn parse_module(source: &str) -> PResult<Block> {
    let tokens = lexer::tokenize(source)?;
    Parser::new(tokens, 0, 0).module()
}

fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Name(name) => format!("'{}'", name),
        TokenKind::Number { .. } => "number".to_string(),
        TokenKind::Str(_) => "string".to_string(),
        TokenKind::Op(op) => format!("'{}'", op),
        TokenKind::Newline => "end of line".to_string(),
        TokenKind::Indent => "unexpected indent".to_string(),
        TokenKind::Dedent => "unexpected dedent".to_string(),
        TokenKind::EndMarker => "end of input".to_string(),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    height: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, depth: usize, height: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth,
            height,
        }
    }

    // ---- token helpers -------------------------------------------------

    fn token(&self) -> &Token {
        // The lexer always terminates the stream with EndMarker.
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn token_at(&self, offset: usize) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.pos + offset).min(last)]
    }

    fn advance(&mut self) -> Token {
        let token = self.token().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn is(&self, kind: &TokenKind) -> bool {
        self.token().kind == *kind
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(&self.token().kind, TokenKind::Op(o) if *o == op)
    }

    fn at_kw(&self, kw: &str) -> bool {
        matches!(&self.token().kind, TokenKind::Name(n) if n == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.at_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_any_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        for &op in ops {
            if self.eat_op(op) {
                return Some(op);
            }
        }
        None
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let token = self.token();
        ParseError::new(
            token.loc,
            format!("invalid syntax: {}, found {}", expected, describe(&token.kind)),
        )
    }

    fn expect_op(&mut self, op: &str) -> PResult<Location> {
        if self.at_op(op) {
            Ok(self.advance().loc)
        } else {
            Err(self.unexpected(&format!("expected '{}'", op)))
        }
    }

    fn expect_kw(&mut self, kw: &str) -> PResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{}'", kw)))
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        if let TokenKind::Name(name) = &self.token().kind
            && !is_keyword(name)
        {
            let name = name.clone();
            self.advance();
            return Ok(name);
        }
        Err(self.unexpected("expected a name"))
    }

    fn expect_newline(&mut self) -> PResult<()> {
        if self.is(&TokenKind::Newline) {
            self.advance();
            Ok(())
        } else if self.is(&TokenKind::EndMarker) {
            Ok(())
        } else {
            Err(self.unexpected("expected end of statement"))
        }
    }

    fn at_end_of_statement(&self) -> bool {
        self.is(&TokenKind::Newline) || self.is(&TokenKind::EndMarker) || self.at_op(";")
    }

    fn at_comprehension(&self) -> bool {
        self.at_kw("for")
            || (self.at_kw("async")
                && matches!(&self.token_at(1).kind, TokenKind::Name(n) if n == "for"))
    }

    fn starts_expression(&self) -> bool {
        match &self.token().kind {
            TokenKind::Name(name) => {
                !is_keyword(name)
                    || matches!(
                        name.as_str(),
                        "True" | "False" | "None" | "not" | "lambda" | "await"
                    )
            }
            TokenKind::Number { .. } | TokenKind::Str(_) => true,
            TokenKind::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+" | "~" | "*" | "..."),
            _ => false,
        }
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        if self.depth >= MAX_DEPTH {
            return Err(ParseError::new(
                self.token().loc,
                format!("blocks or expressions nested more than {MAX_DEPTH} levels deep"),
            ));
        }
        let (depth, height) = (self.depth, self.height);
        self.depth += 1;
        let result = self.link().and_then(|()| f(self));
        self.depth = depth;
        self.height = height;
        result
    }

    /// Run `f`, which builds a left-deep chain, then release the links it
    /// charged.
    fn chain(&mut self, f: impl FnOnce(&mut Self) -> PResult<Expr>) -> PResult<Expr> {
        let height = self.height;
        let result = f(self);
        self.height = height;
        result
    }

    fn link(&mut self) -> PResult<()> {
        if self.height >= MAX_TREE_HEIGHT {
            return Err(ParseError::new(
                self.token().loc,
                format!("expression tree deeper than {MAX_TREE_HEIGHT} levels"),
            ));
        }
        self.height += 1;
        Ok(())
    }

    // ---- statements ----------------------------------------------------

    fn module(mut self) -> PResult<Block> {
        let mut body = Vec::new();
        loop {
            if self.is(&TokenKind::Newline) {
                self.advance();
            } else if self.is(&TokenKind::EndMarker) {
                break;
            } else {
                body.extend(self.statement()?);
            }
        }
        Ok(body)
    }

    fn statement(&mut self) -> PResult<Vec<Stmt>> {
        self.nested(|p| {
            let compound = p.at_op("@") || COMPOUND_KEYWORDS.iter().any(|kw| p.at_kw(kw));
            if compound {
                Ok(vec![p.compound_statement()?])
            } else {
                p.simple_statements()
            }
        })
    }

    fn block(&mut self) -> PResult<Block> {
        if !self.is(&TokenKind::Newline) {
            return self.simple_statements();
        }
        self.advance();
        if !self.is(&TokenKind::Indent) {
            return Err(self.unexpected("expected an indented block"));
        }
        self.advance();

        let mut body = Vec::new();
        while !self.is(&TokenKind::Dedent) && !self.is(&TokenKind::EndMarker) {
            if self.is(&TokenKind::Newline) {
                self.advance();
                continue;
            }
            body.extend(self.statement()?);
        }
        if self.is(&TokenKind::Dedent) {
            self.advance();
        }
        Ok(body)
    }

    fn else_block(&mut self) -> PResult<Block> {
        if self.eat_kw("else") {
            self.expect_op(":")?;
            self.block()
        } else {
            Ok(Vec::new())
        }
    }

    fn compound_statement(&mut self) -> PResult<Stmt> {
        let loc = self.token().loc;
        if self.at_op("@") {
            return self.decorated(loc);
        }
        if self.eat_kw("def") {
            return self.function_def(loc, Vec::new(), false);
        }
        if self.eat_kw("class") {
            return self.class_def(loc, Vec::new());
        }
        if self.eat_kw("if") {
            return self.if_statement(loc);
        }
        if self.eat_kw("while") {
            let test = self.named_expr()?;
            self.expect_op(":")?;
            let body = self.block()?;
            let orelse = self.else_block()?;
            return Ok(Stmt {
                loc,
                kind: StmtKind::While { test, body, orelse },
            });
        }
        if self.eat_kw("for") {
            return self.for_statement(loc, false);
        }
        if self.eat_kw("try") {
            return self.try_statement(loc);
        }
        if self.eat_kw("with") {
            return self.with_statement(loc, false);
        }
        if self.eat_kw("async") {
            if self.eat_kw("def") {
                return self.function_def(loc, Vec::new(), true);
            }
            if self.eat_kw("for") {
                return self.for_statement(loc, true);
            }
            if self.eat_kw("with") {
                return self.with_statement(loc, true);
            }
            return Err(self.unexpected("expected 'def', 'for' or 'with' after 'async'"));
        }
        Err(self.unexpected("expected a statement"))
    }

    fn decorated(&mut self, loc: Location) -> PResult<Stmt> {
        let mut decorators = Vec::new();
        while self.eat_op("@") {
            decorators.push(self.named_expr()?);
            self.expect_newline()?;
        }
        if self.eat_kw("def") {
            return self.function_def(loc, decorators, false);
        }
        if self.eat_kw("async") {
            self.expect_kw("def")?;
            return self.function_def(loc, decorators, true);
        }
        if self.eat_kw("class") {
            return self.class_def(loc, decorators);
        }
        Err(self.unexpected("expected a function or class after decorator"))
    }

    fn function_def(
        &mut self,
        loc: Location,
        decorators: Vec<Expr>,
        is_async: bool,
    ) -> PResult<Stmt> {
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.parameters(")", true)?;
        self.expect_op(")")?;
        let returns = if self.eat_op("->") {
            Some(self.test()?)
        } else {
            None
        };
        self.expect_op(":")?;
        let body = self.block()?;
        Ok(Stmt {
            loc,
            kind: StmtKind::FunctionDef {
                name,
                params,
                returns,
                body,
                decorators,
                is_async,
            },
        })
    }

    fn parameters(&mut self, close: &str, annotated: bool) -> PResult<Vec<Param>> {
        let mut params = Vec::new();
        while !self.at_op(close) {
            if self.eat_op("/") {
                // positional-only marker
            } else if self.eat_op("**") {
                let name = self.expect_name()?;
                let annotation = self.annotation(annotated)?;
                params.push(Param {
                    name,
                    kind: ParamKind::KwArgs,
                    annotation,
                    default: None,
                });
            } else if self.eat_op("*") {
                if !self.at_op(",") && !self.at_op(close) {
                    let name = self.expect_name()?;
                    let annotation = self.annotation(annotated)?;
                    params.push(Param {
                        name,
                        kind: ParamKind::VarArgs,
                        annotation,
                        default: None,
                    });
                }
            } else {
                let name = self.expect_name()?;
                let annotation = self.annotation(annotated)?;
                let default = if self.eat_op("=") {
                    Some(self.test()?)
                } else {
                    None
                };
                params.push(Param {
                    name,
                    kind: ParamKind::Regular,
                    annotation,
                    default,
                });
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    fn annotation(&mut self, annotated: bool) -> PResult<Option<Expr>> {
        if annotated && self.eat_op(":") {
            Ok(Some(self.test()?))
        } else {
            Ok(None)
        }
    }

    fn class_def(&mut self, loc: Location, decorators: Vec<Expr>) -> PResult<Stmt> {
        let name = self.expect_name()?;
        let bases = if self.eat_op("(") {
            let args = self.arguments()?;
            self.expect_op(")")?;
            args
        } else {
            Vec::new()
        };
        self.expect_op(":")?;
        let body = self.block()?;
        Ok(Stmt {
            loc,
            kind: StmtKind::ClassDef {
                name,
                bases,
                body,
                decorators,
            },
        })
    }

    fn if_statement(&mut self, loc: Location) -> PResult<Stmt> {
        let test = self.named_expr()?;
        self.expect_op(":")?;
        let body = self.block()?;
        let orelse = if self.at_kw("elif") {
            let elif_loc = self.advance().loc;
            vec![self.nested(|p| p.if_statement(elif_loc))?]
        } else {
            self.else_block()?
        };
        Ok(Stmt {
            loc,
            kind: StmtKind::If { test, body, orelse },
        })
    }

    fn for_statement(&mut self, loc: Location, is_async: bool) -> PResult<Stmt> {
        let target = self.target_list()?;
        self.expect_kw("in")?;
        let iter = self.star_expressions()?;
        self.expect_op(":")?;
        let body = self.block()?;
        let orelse = self.else_block()?;
        Ok(Stmt {
            loc,
            kind: StmtKind::For {
                target,
                iter,
                body,
                orelse,
                is_async,
            },
        })
    }

    fn try_statement(&mut self, loc: Location) -> PResult<Stmt> {
        self.expect_op(":")?;
        let body = self.block()?;

        let mut handlers = Vec::new();
        while self.at_kw("except") {
            let handler_loc = self.advance().loc;
            self.eat_op("*");
            let (kind, name) = if self.at_op(":") {
                (None, None)
            } else {
                let kind = self.test()?;
                let name = if self.eat_kw("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                (Some(kind), name)
            };
            self.expect_op(":")?;
            let body = self.block()?;
            handlers.push(ExceptHandler {
                loc: handler_loc,
                kind,
                name,
                body,
            });
        }

        let orelse = if handlers.is_empty() {
            Vec::new()
        } else {
            self.else_block()?
        };
        let has_finally = self.eat_kw("finally");
        let finalbody = if has_finally {
            self.expect_op(":")?;
            self.block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && !has_finally {
            return Err(self.unexpected("expected 'except' or 'finally' block"));
        }

        Ok(Stmt {
            loc,
            kind: StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            },
        })
    }

    fn with_statement(&mut self, loc: Location, is_async: bool) -> PResult<Stmt> {
        let mut items = Vec::new();
        loop {
            let context = self.test()?;
            let target = if self.eat_kw("as") {
                Some(self.star_target()?)
            } else {
                None
            };
            items.push(WithItem { context, target });
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(":")?;
        let body = self.block()?;
        Ok(Stmt {
            loc,
            kind: StmtKind::With {
                items,
                body,
                is_async,
            },
        })
    }

    fn simple_statements(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = vec![self.small_statement()?];
        while self.eat_op(";") {
            if self.is(&TokenKind::Newline) || self.is(&TokenKind::EndMarker) {
                break;
            }
            stmts.push(self.small_statement()?);
        }
        self.expect_newline()?;
        Ok(stmts)
    }

    fn small_statement(&mut self) -> PResult<Stmt> {
        let loc = self.token().loc;
        let kind = if self.eat_kw("pass") {
            StmtKind::Pass
        } else if self.eat_kw("break") {
            StmtKind::Break
        } else if self.eat_kw("continue") {
            StmtKind::Continue
        } else if self.eat_kw("return") {
            if self.at_end_of_statement() {
                StmtKind::Return(None)
            } else {
                StmtKind::Return(Some(self.star_expressions()?))
            }
        } else if self.eat_kw("raise") {
            if self.at_end_of_statement() {
                StmtKind::Raise {
                    exc: None,
                    cause: None,
                }
            } else {
                let exc = self.test()?;
                let cause = if self.eat_kw("from") {
                    Some(self.test()?)
                } else {
                    None
                };
                StmtKind::Raise {
                    exc: Some(exc),
                    cause,
                }
            }
        } else if self.eat_kw("global") {
            StmtKind::Global(self.name_list()?)
        } else if self.eat_kw("nonlocal") {
            StmtKind::Nonlocal(self.name_list()?)
        } else if self.eat_kw("del") {
            match self.target_list()? {
                Expr {
                    kind: ExprKind::Tuple(items),
                    ..
                } => StmtKind::Delete(items),
                target => StmtKind::Delete(vec![target]),
            }
        } else if self.eat_kw("assert") {
            let test = self.test()?;
            let msg = if self.eat_op(",") {
                Some(self.test()?)
            } else {
                None
            };
            StmtKind::Assert { test, msg }
        } else if self.eat_kw("import") {
            StmtKind::Import(self.dotted_as_names()?)
        } else if self.eat_kw("from") {
            self.import_from()?
        } else {
            self.expression_statement()?
        };
        Ok(Stmt { loc, kind })
    }

    fn name_list(&mut self) -> PResult<Vec<String>> {
        let mut names = vec![self.expect_name()?];
        while self.eat_op(",") {
            names.push(self.expect_name()?);
        }
        Ok(names)
    }

    fn dotted_name(&mut self) -> PResult<String> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn dotted_as_names(&mut self) -> PResult<Vec<Alias>> {
        let mut names = Vec::new();
        loop {
            let loc = self.token().loc;
            let name = self.dotted_name()?;
            let asname = if self.eat_kw("as") {
                Some(self.expect_name()?)
            } else {
                None
            };
            names.push(Alias { loc, name, asname });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(names)
    }

    fn import_from(&mut self) -> PResult<StmtKind> {
        let mut level = 0;
        loop {
            if self.eat_op(".") {
                level += 1;
            } else if self.eat_op("...") {
                level += 3;
            } else {
                break;
            }
        }
        let module = if level > 0 && self.at_kw("import") {
            None
        } else {
            Some(self.dotted_name()?)
        };
        self.expect_kw("import")?;

        let names = if self.at_op("*") {
            let loc = self.advance().loc;
            vec![Alias {
                loc,
                name: "*".to_string(),
                asname: None,
            }]
        } else if self.eat_op("(") {
            let names = self.import_as_names(true)?;
            self.expect_op(")")?;
            names
        } else {
            self.import_as_names(false)?
        };

        Ok(StmtKind::ImportFrom {
            module,
            level,
            names,
        })
    }

    fn import_as_names(&mut self, parenthesized: bool) -> PResult<Vec<Alias>> {
        let mut names = Vec::new();
        loop {
            let loc = self.token().loc;
            let name = self.expect_name()?;
            let asname = if self.eat_kw("as") {
                Some(self.expect_name()?)
            } else {
                None
            };
            names.push(Alias { loc, name, asname });
            if !self.eat_op(",") || (parenthesized && self.at_op(")")) {
                break;
            }
        }
        Ok(names)
    }

    fn expression_statement(&mut self) -> PResult<StmtKind> {
        let first = self.star_expressions_or_yield()?;

        if self.eat_op(":") {
            let annotation = self.test()?;
            let value = if self.eat_op("=") {
                Some(self.star_expressions_or_yield()?)
            } else {
                None
            };
            return Ok(StmtKind::AnnAssign {
                target: first,
                annotation,
                value,
            });
        }

        if let TokenKind::Op(op) = &self.token().kind
            && AUGMENTED_OPS.contains(op)
        {
            let op = *op;
            self.advance();
            let value = self.star_expressions_or_yield()?;
            return Ok(StmtKind::AugAssign {
                target: first,
                op,
                value,
            });
        }

        if self.at_op("=") {
            let mut targets = Vec::new();
            let mut value = first;
            while self.eat_op("=") {
                targets.push(value);
                value = self.star_expressions_or_yield()?;
            }
            return Ok(StmtKind::Assign { targets, value });
        }

        Ok(StmtKind::Expr(first))
    }

    // ---- expressions ---------------------------------------------------

    fn star_expressions_or_yield(&mut self) -> PResult<Expr> {
        if self.at_kw("yield") {
            self.yield_expr()
        } else {
            self.star_expressions()
        }
    }

    fn star_expressions(&mut self) -> PResult<Expr> {
        let first = self.star_named()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let loc = first.loc;
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expression() {
                break;
            }
            items.push(self.star_named()?);
        }
        Ok(Expr::new(loc, ExprKind::Tuple(items)))
    }

    fn star_named(&mut self) -> PResult<Expr> {
        if self.at_op("*") {
            let loc = self.advance().loc;
            let inner = self.nested(|p| p.binary(0))?;
            return Ok(Expr::new(loc, ExprKind::Starred(Box::new(inner))));
        }
        self.named_expr()
    }

    fn star_target(&mut self) -> PResult<Expr> {
        if self.at_op("*") {
            let loc = self.advance().loc;
            let inner = self.nested(|p| p.binary(0))?;
            return Ok(Expr::new(loc, ExprKind::Starred(Box::new(inner))));
        }
        self.binary(0)
    }

    fn target_list(&mut self) -> PResult<Expr> {
        let first = self.star_target()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let loc = first.loc;
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_kw("in") || !self.starts_expression() {
                break;
            }
            items.push(self.star_target()?);
        }
        Ok(Expr::new(loc, ExprKind::Tuple(items)))
    }

    fn named_expr(&mut self) -> PResult<Expr> {
        let expr = self.test()?;
        if self.at_op(":=") {
            if expr.as_name().is_none() {
                return Err(ParseError::new(
                    expr.loc,
                    "cannot use assignment expressions with this target",
                ));
            }
            self.advance();
            let value = self.test()?;
            return Ok(Expr::new(
                expr.loc,
                ExprKind::NamedExpr {
                    target: Box::new(expr),
                    value: Box::new(value),
                },
            ));
        }
        Ok(expr)
    }

    fn test(&mut self) -> PResult<Expr> {
        self.nested(|p| {
            if p.at_kw("lambda") {
                return p.lambda();
            }
            let body = p.or_test()?;
            if p.eat_kw("if") {
                let test = p.or_test()?;
                p.expect_kw("else")?;
                let orelse = p.test()?;
                return Ok(Expr::new(
                    body.loc,
                    ExprKind::IfExp {
                        test: Box::new(test),
                        body: Box::new(body),
                        orelse: Box::new(orelse),
                    },
                ));
            }
            Ok(body)
        })
    }

    fn lambda(&mut self) -> PResult<Expr> {
        let loc = self.advance().loc;
        let params = self.parameters(":", false)?;
        self.expect_op(":")?;
        let body = self.test()?;
        Ok(Expr::new(
            loc,
            ExprKind::Lambda {
                params,
                body: Box::new(body),
            },
        ))
    }

    fn or_test(&mut self) -> PResult<Expr> {
        let first = self.and_test()?;
        if !self.at_kw("or") {
            return Ok(first);
        }
        let loc = first.loc;
        let mut values = vec![first];
        while self.eat_kw("or") {
            values.push(self.and_test()?);
        }
        Ok(Expr::new(
            loc,
            ExprKind::BoolOp {
                op: BoolOp::Or,
                values,
            },
        ))
    }

    fn and_test(&mut self) -> PResult<Expr> {
        let first = self.not_test()?;
        if !self.at_kw("and") {
            return Ok(first);
        }
        let loc = first.loc;
        let mut values = vec![first];
        while self.eat_kw("and") {
            values.push(self.not_test()?);
        }
        Ok(Expr::new(
            loc,
            ExprKind::BoolOp {
                op: BoolOp::And,
                values,
            },
        ))
    }

    fn not_test(&mut self) -> PResult<Expr> {
        if self.at_kw("not") {
            let loc = self.advance().loc;
            let operand = self.nested(|p| p.not_test())?;
            return Ok(Expr::new(
                loc,
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
            ));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let left = self.binary(0)?;
        let mut comparisons = Vec::new();
        while let Some(op) = self.comparison_op() {
            comparisons.push((op, self.binary(0)?));
        }
        if comparisons.is_empty() {
            return Ok(left);
        }
        Ok(Expr::new(
            left.loc,
            ExprKind::Compare {
                left: Box::new(left),
                comparisons,
            },
        ))
    }

    fn comparison_op(&mut self) -> Option<&'static str> {
        if let Some(op) = self.eat_any_op(&["<", ">", "==", ">=", "<=", "!="]) {
            return Some(op);
        }
        if self.eat_kw("in") {
            return Some("in");
        }
        if self.at_kw("not") && matches!(&self.token_at(1).kind, TokenKind::Name(n) if n == "in")
        {
            self.advance();
            self.advance();
            return Some("not in");
        }
        if self.eat_kw("is") {
            return Some(if self.eat_kw("not") { "is not" } else { "is" });
        }
        None
    }

    fn binary(&mut self, level: usize) -> PResult<Expr> {
        let Some(ops) = BINARY_LEVELS.get(level) else {
            return self.factor();
        };
        self.chain(|p| {
            let mut left = p.binary(level + 1)?;
            while let Some(op) = p.eat_any_op(ops) {
                p.link()?;
                let right = p.binary(level + 1)?;
                let loc = left.loc;
                left = Expr::new(
                    loc,
                    ExprKind::Binary {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                );
            }
            Ok(left)
        })
    }

    fn factor(&mut self) -> PResult<Expr> {
        let op = if self.at_op("-") {
            Some(UnaryOp::Neg)
        } else if self.at_op("+") {
            Some(UnaryOp::Pos)
        } else if self.at_op("~") {
            Some(UnaryOp::Invert)
        } else {
            None
        };
        if let Some(op) = op {
            let loc = self.advance().loc;
            let operand = self.nested(|p| p.factor())?;
            return Ok(Expr::new(
                loc,
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
            ));
        }
        self.power()
    }

    fn power(&mut self) -> PResult<Expr> {
        let base = if self.at_kw("await") {
            let loc = self.advance().loc;
            let inner = self.primary()?;
            Expr::new(loc, ExprKind::Await(Box::new(inner)))
        } else {
            self.primary()?
        };
        if self.eat_op("**") {
            let exponent = self.nested(|p| p.factor())?;
            return Ok(Expr::new(
                base.loc,
                ExprKind::Binary {
                    op: "**",
                    left: Box::new(base),
                    right: Box::new(exponent),
                },
            ));
        }
        Ok(base)
    }

    fn primary(&mut self) -> PResult<Expr> {
        self.chain(Self::trailers)
    }

    fn trailers(&mut self) -> PResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            let loc = expr.loc;
            if self.at_op("(") || self.at_op("[") || self.at_op(".") {
                self.link()?;
            }
            if self.eat_op("(") {
                let args = self.arguments()?;
                self.expect_op(")")?;
                expr = Expr::new(
                    loc,
                    ExprKind::Call {
                        func: Box::new(expr),
                        args,
                    },
                );
            } else if self.eat_op("[") {
                let index = self.subscript()?;
                self.expect_op("]")?;
                expr = Expr::new(
                    loc,
                    ExprKind::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    },
                );
            } else if self.eat_op(".") {
                let attr = self.expect_name()?;
                expr = Expr::new(
                    loc,
                    ExprKind::Attribute {
                        value: Box::new(expr),
                        attr,
                    },
                );
            } else {
                return Ok(expr);
            }
        }
    }

    fn atom(&mut self) -> PResult<Expr> {
        let token = self.token().clone();
        let loc = token.loc;
        match token.kind {
            TokenKind::Op("(") => {
                self.advance();
                self.paren_atom(loc)
            }
            TokenKind::Op("[") => {
                self.advance();
                self.list_atom(loc)
            }
            TokenKind::Op("{") => {
                self.advance();
                self.brace_atom(loc)
            }
            TokenKind::Op("...") => {
                self.advance();
                Ok(Expr::new(loc, ExprKind::Constant(Constant::Ellipsis)))
            }
            TokenKind::Number { int, is_int } => {
                self.advance();
                let kind = if is_int {
                    ExprKind::Int(int)
                } else {
                    ExprKind::Float
                };
                Ok(Expr::new(loc, kind))
            }
            TokenKind::Str(_) => self.strings(),
            TokenKind::Name(name) => {
                let constant = match name.as_str() {
                    "True" => Some(Constant::True),
                    "False" => Some(Constant::False),
                    "None" => Some(Constant::None),
                    _ => None,
                };
                if let Some(constant) = constant {
                    self.advance();
                    return Ok(Expr::new(loc, ExprKind::Constant(constant)));
                }
                if is_keyword(&name) {
                    return Err(self.unexpected("expected an expression"));
                }
                self.advance();
                Ok(Expr::new(loc, ExprKind::Name(name)))
            }
            _ => Err(self.unexpected("expected an expression")),
        }
    }

    fn paren_atom(&mut self, loc: Location) -> PResult<Expr> {
        if self.eat_op(")") {
            return Ok(Expr::new(loc, ExprKind::Tuple(Vec::new())));
        }
        if self.at_kw("yield") {
            let expr = self.yield_expr()?;
            self.expect_op(")")?;
            return Ok(expr);
        }

        let first = self.star_named()?;
        if self.at_comprehension() {
            let generators = self.generators()?;
            self.expect_op(")")?;
            return Ok(Expr::new(
                loc,
                ExprKind::Comprehension {
                    kind: CompKind::Generator,
                    element: Box::new(first),
                    value: None,
                    generators,
                },
            ));
        }
        if self.at_op(",") {
            let mut items = vec![first];
            while self.eat_op(",") {
                if self.at_op(")") {
                    break;
                }
                items.push(self.star_named()?);
            }
            self.expect_op(")")?;
            return Ok(Expr::new(loc, ExprKind::Tuple(items)));
        }
        self.expect_op(")")?;
        Ok(first)
    }

    fn list_atom(&mut self, loc: Location) -> PResult<Expr> {
        if self.eat_op("]") {
            return Ok(Expr::new(loc, ExprKind::List(Vec::new())));
        }
        let first = self.star_named()?;
        if self.at_comprehension() {
            let generators = self.generators()?;
            self.expect_op("]")?;
            return Ok(Expr::new(
                loc,
                ExprKind::Comprehension {
                    kind: CompKind::List,
                    element: Box::new(first),
                    value: None,
                    generators,
                },
            ));
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            items.push(self.star_named()?);
        }
        self.expect_op("]")?;
        Ok(Expr::new(loc, ExprKind::List(items)))
    }

    fn brace_atom(&mut self, loc: Location) -> PResult<Expr> {
        if self.eat_op("}") {
            return Ok(Expr::new(loc, ExprKind::Dict(Vec::new())));
        }
        if self.eat_op("**") {
            let value = self.nested(|p| p.binary(0))?;
            return self.dict_display(loc, DictItem { key: None, value });
        }

        let first = self.star_named()?;
        if self.eat_op(":") {
            let value = self.test()?;
            if self.at_comprehension() {
                let generators = self.generators()?;
                self.expect_op("}")?;
                return Ok(Expr::new(
                    loc,
                    ExprKind::Comprehension {
                        kind: CompKind::Dict,
                        element: Box::new(first),
                        value: Some(Box::new(value)),
                        generators,
                    },
                ));
            }
            return self.dict_display(
                loc,
                DictItem {
                    key: Some(first),
                    value,
                },
            );
        }

        if self.at_comprehension() {
            let generators = self.generators()?;
            self.expect_op("}")?;
            return Ok(Expr::new(
                loc,
                ExprKind::Comprehension {
                    kind: CompKind::Set,
                    element: Box::new(first),
                    value: None,
                    generators,
                },
            ));
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("}") {
                break;
            }
            items.push(self.star_named()?);
        }
        self.expect_op("}")?;
        Ok(Expr::new(loc, ExprKind::Set(items)))
    }

    fn dict_display(&mut self, loc: Location, first: DictItem) -> PResult<Expr> {
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("}") {
                break;
            }
            if self.eat_op("**") {
                let value = self.nested(|p| p.binary(0))?;
                items.push(DictItem { key: None, value });
            } else {
                let key = self.test()?;
                self.expect_op(":")?;
                let value = self.test()?;
                items.push(DictItem {
                    key: Some(key),
                    value,
                });
            }
        }
        self.expect_op("}")?;
        Ok(Expr::new(loc, ExprKind::Dict(items)))
    }

    fn generators(&mut self) -> PResult<Vec<Generator>> {
        let mut generators = Vec::new();
        while self.at_comprehension() {
            let is_async = self.eat_kw("async");
            self.expect_kw("for")?;
            let target = self.target_list()?;
            self.expect_kw("in")?;
            let iter = self.or_test()?;
            let mut conditions = Vec::new();
            while self.eat_kw("if") {
                conditions.push(self.or_test()?);
            }
            generators.push(Generator {
                target,
                iter,
                conditions,
                is_async,
            });
        }
        Ok(generators)
    }

    fn subscript(&mut self) -> PResult<Expr> {
        let first = self.slice_item()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let loc = first.loc;
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            items.push(self.slice_item()?);
        }
        Ok(Expr::new(loc, ExprKind::Tuple(items)))
    }

    fn at_slice_end(&self) -> bool {
        self.at_op("]") || self.at_op(",") || self.at_op(":")
    }

    fn slice_item(&mut self) -> PResult<Expr> {
        let loc = self.token().loc;
        let lower = if self.at_op(":") {
            None
        } else {
            let expr = self.star_named()?;
            if !self.at_op(":") {
                return Ok(expr);
            }
            Some(Box::new(expr))
        };
        self.expect_op(":")?;
        let upper = if self.at_slice_end() {
            None
        } else {
            Some(Box::new(self.test()?))
        };
        let step = if self.eat_op(":") && !self.at_slice_end() {
            Some(Box::new(self.test()?))
        } else {
            None
        };
        Ok(Expr::new(loc, ExprKind::Slice { lower, upper, step }))
    }

    fn arguments(&mut self) -> PResult<Vec<Arg>> {
        let mut args = Vec::new();
        while !self.at_op(")") {
            if self.eat_op("**") {
                args.push(Arg {
                    name: None,
                    star: Star::Double,
                    value: self.test()?,
                });
            } else if self.eat_op("*") {
                args.push(Arg {
                    name: None,
                    star: Star::Single,
                    value: self.test()?,
                });
            } else {
                let value = self.named_expr()?;
                if self.at_op("=") {
                    let Some(name) = value.as_name().map(str::to_owned) else {
                        return Err(ParseError::new(
                            value.loc,
                            "expression cannot be used as a keyword argument",
                        ));
                    };
                    self.advance();
                    args.push(Arg {
                        name: Some(name),
                        star: Star::None,
                        value: self.test()?,
                    });
                } else if self.at_comprehension() {
                    let loc = value.loc;
                    let generators = self.generators()?;
                    args.push(Arg {
                        name: None,
                        star: Star::None,
                        value: Expr::new(
                            loc,
                            ExprKind::Comprehension {
                                kind: CompKind::Generator,
                                element: Box::new(value),
                                value: None,
                                generators,
                            },
                        ),
                    });
                } else {
                    args.push(Arg {
                        name: None,
                        star: Star::None,
                        value,
                    });
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(args)
    }

    fn yield_expr(&mut self) -> PResult<Expr> {
        let loc = self.advance().loc;
        if self.eat_kw("from") {
            let inner = self.test()?;
            return Ok(Expr::new(loc, ExprKind::YieldFrom(Box::new(inner))));
        }
        if self.at_end_of_statement() || self.at_op(")") || self.at_op("=") {
            return Ok(Expr::new(loc, ExprKind::Yield(None)));
        }
        let value = self.star_expressions()?;
        Ok(Expr::new(loc, ExprKind::Yield(Some(Box::new(value)))))
    }

    /// Adjacent string literals concatenate into one expression.
    fn strings(&mut self) -> PResult<Expr> {
        let loc = self.token().loc;
        let mut text = String::new();
        let mut fields = Vec::new();
        let mut is_fstring = false;
        let mut is_bytes: Option<bool> = None;

        while let TokenKind::Str(lit) = &self.token().kind {
            let lit = lit.clone();
            self.advance();
            match is_bytes {
                Some(bytes) if bytes != lit.bytes => {
                    return Err(ParseError::new(
                        loc,
                        "cannot mix bytes and nonbytes literals",
                    ));
                }
                _ => is_bytes = Some(lit.bytes),
            }
            if lit.fstring {
                is_fstring = true;
                fields.extend(self.fstring_fields(&lit)?);
            } else {
                text.push_str(&lit.body);
            }
        }

        let kind = if is_bytes == Some(true) {
            ExprKind::Bytes
        } else if is_fstring {
            ExprKind::FString(fields)
        } else {
            ExprKind::Str(text)
        };
        Ok(Expr::new(loc, kind))
    }

    fn fstring_fields(&mut self, lit: &StrLit) -> PResult<Vec<Expr>> {
        let chars: Vec<char> = lit.body.chars().collect();
        let mut cursor = FieldCursor {
            chars: &chars,
            pos: 0,
            loc: lit.start,
        };
        let mut sources = Vec::new();
        scan_fstring(&mut cursor, false, &mut sources)?;

        let mut exprs = Vec::new();
        for (source, loc) in sources {
            // Parenthesize so the field may span lines; shift left one
            // column so the expression keeps its own position.
            let origin = Location {
                line: loc.line,
                column: loc.column.saturating_sub(1),
            };
            let tokens = lexer::tokenize_at(&format!("({})", source), origin)?;
            let mut sub = Parser::new(tokens, self.depth, self.height);
            exprs.push(sub.nested(|p| p.standalone_expression())?);
        }
        Ok(exprs)
    }

    fn standalone_expression(&mut self) -> PResult<Expr> {
        let expr = self.star_expressions_or_yield()?;
        if self.is(&TokenKind::Newline) {
            self.advance();
        }
        if !self.is(&TokenKind::EndMarker) {
            return Err(self.unexpected("expected end of f-string expression"));
        }
        Ok(expr)
    }
}

struct FieldCursor<'a> {
    chars: &'a [char],
    pos: usize,
    loc: Location,
}

impl FieldCursor<'_> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.loc.line += 1;
            self.loc.column = 1;
        } else {
            self.loc.column += 1;
        }
        Some(c)
    }
}

/// Collect replacement-field sources from an f-string body. Inside a
/// format spec (`in_spec`) scanning stops before the closing `}`.
fn scan_fstring(
    cursor: &mut FieldCursor<'_>,
    in_spec: bool,
    fields: &mut Vec<(String, Location)>,
) -> PResult<()> {
    while let Some(c) = cursor.peek() {
        match c {
            '{' if !in_spec && cursor.peek_next() == Some('{') => {
                cursor.bump();
                cursor.bump();
            }
            '{' => {
                cursor.bump();
                scan_field(cursor, fields)?;
            }
            '}' if in_spec => return Ok(()),
            '}' if cursor.peek_next() == Some('}') => {
                cursor.bump();
                cursor.bump();
            }
            '}' => {
                return Err(ParseError::new(
                    cursor.loc,
                    "f-string: single '}' is not allowed",
                ));
            }
            _ => {
                cursor.bump();
            }
        }
    }
    if in_spec {
        return Err(ParseError::new(cursor.loc, "f-string: expecting '}'"));
    }
    Ok(())
}

fn scan_field(cursor: &mut FieldCursor<'_>, fields: &mut Vec<(String, Location)>) -> PResult<()> {
    let start = cursor.loc;
    let mut source = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    loop {
        let Some(c) = cursor.peek() else {
            return Err(ParseError::new(start, "f-string: expecting '}'"));
        };
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            source.push(c);
            cursor.bump();
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' if depth > 0 => depth -= 1,
            '}' => break,
            '!' if depth == 0 && cursor.peek_next() != Some('=') => break,
            ':' if depth == 0 => break,
            _ => {}
        }
        source.push(c);
        cursor.bump();
    }

    // `{expr=}` debug form
    let trimmed = source.trim_end();
    let expression = match trimmed.strip_suffix('=') {
        Some(rest) if !rest.ends_with(['=', '!', '<', '>']) => rest.to_string(),
        _ => source.clone(),
    };
    if expression.trim().is_empty() {
        return Err(ParseError::new(
            start,
            "f-string: empty expression not allowed",
        ));
    }
    fields.push((expression, start));

    if cursor.peek() == Some('!') {
        cursor.bump();
        while let Some(c) = cursor.peek() {
            if c == ':' || c == '}' {
                break;
            }
            cursor.bump();
        }
    }
    if cursor.peek() == Some(':') {
        cursor.bump();
        scan_fstring(cursor, true, fields)?;
    }
    if cursor.bump() != Some('}') {
        return Err(ParseError::new(start, "f-string: expecting '}'"));
    }
    Ok(())
}
