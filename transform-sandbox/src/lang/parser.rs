//! Recursive-descent parser for the transform dialect.
//!
//! Anything outside the dialect fails here, which means it fails
//! during static analysis, before any process is spawned. Asynchronous
//! constructs, classes, lambdas and the like are not part of the
//! grammar at all.

use super::ast::*;
use super::lexer::{tokenize, LexError, SpannedTok, Tok};

#[derive(Debug, Clone)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl From<LexError> for ParseError {
    fn from(error: LexError) -> Self {
        ParseError {
            line: error.line,
            message: error.message,
        }
    }
}

pub fn parse(source: &str) -> Result<Program, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.program()
}

struct Parser {
    tokens: Vec<SpannedTok>,
    pos: usize,
}

impl Parser {
    fn program(&mut self) -> Result<Program, ParseError> {
        let mut body = Vec::new();
        while !self.check(&Tok::Eof) {
            if self.eat(&Tok::Newline) {
                continue;
            }
            body.extend(self.statement()?);
        }
        Ok(Program { body })
    }

    /// One statement line; simple statements may carry several
    /// `;`-separated small statements.
    fn statement(&mut self) -> Result<Vec<Stmt>, ParseError> {
        match self.peek() {
            Tok::Def => Ok(vec![self.function_def()?]),
            Tok::If => Ok(vec![self.if_stmt()?]),
            Tok::While => Ok(vec![self.while_stmt()?]),
            Tok::For => Ok(vec![self.for_stmt()?]),
            _ => self.simple_stmt_line(),
        }
    }

    fn simple_stmt_line(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = vec![self.small_stmt()?];
        while self.eat(&Tok::Semicolon) {
            if self.check(&Tok::Newline) || self.check(&Tok::Eof) {
                break;
            }
            stmts.push(self.small_stmt()?);
        }
        self.expect_newline()?;
        Ok(stmts)
    }

    fn small_stmt(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        match self.peek() {
            Tok::Return => {
                self.advance();
                let value = if self.check(&Tok::Newline)
                    || self.check(&Tok::Semicolon)
                    || self.check(&Tok::Eof)
                {
                    None
                } else {
                    Some(self.expression()?)
                };
                Ok(Stmt::Return { value, line })
            }
            Tok::Pass => {
                self.advance();
                Ok(Stmt::Pass { line })
            }
            Tok::Break => {
                self.advance();
                Ok(Stmt::Break { line })
            }
            Tok::Continue => {
                self.advance();
                Ok(Stmt::Continue { line })
            }
            Tok::Import => self.import_stmt(),
            Tok::From => self.from_import_stmt(),
            _ => self.expr_or_assign(),
        }
    }

    fn import_stmt(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.advance();
        let module = self.dotted_name()?;
        let alias = if self.eat(&Tok::As) {
            Some(self.name()?)
        } else {
            None
        };
        Ok(Stmt::Import {
            module,
            alias,
            line,
        })
    }

    fn from_import_stmt(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.advance();
        let module = self.dotted_name()?;
        self.expect(&Tok::Import)?;
        let mut names = vec![self.name()?];
        while self.eat(&Tok::Comma) {
            names.push(self.name()?);
        }
        Ok(Stmt::FromImport {
            module,
            names,
            line,
        })
    }

    fn expr_or_assign(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        let expr = self.expression()?;

        let aug_op = match self.peek() {
            Tok::PlusAssign => Some(BinOp::Add),
            Tok::MinusAssign => Some(BinOp::Sub),
            Tok::StarAssign => Some(BinOp::Mul),
            Tok::SlashAssign => Some(BinOp::Div),
            Tok::DoubleSlashAssign => Some(BinOp::FloorDiv),
            Tok::PercentAssign => Some(BinOp::Mod),
            Tok::DoubleStarAssign => Some(BinOp::Pow),
            _ => None,
        };

        if let Some(op) = aug_op {
            self.advance();
            let target = self.as_target(expr, line)?;
            let value = self.expression()?;
            return Ok(Stmt::AugAssign {
                target,
                op,
                value,
                line,
            });
        }

        if self.eat(&Tok::Assign) {
            let target = self.as_target(expr, line)?;
            let value = self.expression()?;
            return Ok(Stmt::Assign {
                target,
                value,
                line,
            });
        }

        Ok(Stmt::Expr { value: expr, line })
    }

    fn as_target(&self, expr: Expr, line: usize) -> Result<Target, ParseError> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Subscript { value, index, .. } => Ok(Target::Subscript {
                value: *value,
                index: *index,
            }),
            Expr::Attribute { .. } => Err(ParseError {
                line,
                message: "attribute assignment is not allowed".to_owned(),
            }),
            _ => Err(ParseError {
                line,
                message: "invalid assignment target".to_owned(),
            }),
        }
    }

    fn function_def(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.advance();
        let name = self.name()?;
        self.expect(&Tok::LParen)?;
        let mut params = Vec::new();
        if !self.check(&Tok::RParen) {
            params.push(self.name()?);
            while self.eat(&Tok::Comma) {
                params.push(self.name()?);
            }
        }
        self.expect(&Tok::RParen)?;
        self.expect(&Tok::Colon)?;
        let body = self.suite()?;
        Ok(Stmt::FunctionDef {
            name,
            params,
            body,
            line,
        })
    }

    fn if_stmt(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.advance();
        let test = self.expression()?;
        self.expect(&Tok::Colon)?;
        let body = self.suite()?;

        let orelse = if self.check(&Tok::Elif) {
            // an elif chain is sugar for a nested if in the else arm
            vec![self.if_stmt_from_elif()?]
        } else if self.eat(&Tok::Else) {
            self.expect(&Tok::Colon)?;
            self.suite()?
        } else {
            Vec::new()
        };

        Ok(Stmt::If {
            test,
            body,
            orelse,
            line,
        })
    }

    fn if_stmt_from_elif(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.advance(); // consume 'elif'
        let test = self.expression()?;
        self.expect(&Tok::Colon)?;
        let body = self.suite()?;

        let orelse = if self.check(&Tok::Elif) {
            vec![self.if_stmt_from_elif()?]
        } else if self.eat(&Tok::Else) {
            self.expect(&Tok::Colon)?;
            self.suite()?
        } else {
            Vec::new()
        };

        Ok(Stmt::If {
            test,
            body,
            orelse,
            line,
        })
    }

    fn while_stmt(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.advance();
        let test = self.expression()?;
        self.expect(&Tok::Colon)?;
        let body = self.suite()?;
        Ok(Stmt::While { test, body, line })
    }

    fn for_stmt(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.advance();
        let mut targets = vec![self.name()?];
        while self.eat(&Tok::Comma) {
            targets.push(self.name()?);
        }
        self.expect(&Tok::In)?;
        let iter = self.expression()?;
        self.expect(&Tok::Colon)?;
        let body = self.suite()?;
        Ok(Stmt::For {
            targets,
            iter,
            body,
            line,
        })
    }

    fn suite(&mut self) -> Result<Vec<Stmt>, ParseError> {
        if !self.check(&Tok::Newline) {
            // inline suite: `while True: pass`
            return self.simple_stmt_line();
        }
        self.advance();
        self.expect(&Tok::Indent)?;
        let mut body = Vec::new();
        while !self.check(&Tok::Dedent) && !self.check(&Tok::Eof) {
            if self.eat(&Tok::Newline) {
                continue;
            }
            body.extend(self.statement()?);
        }
        self.expect(&Tok::Dedent)?;
        if body.is_empty() {
            return Err(ParseError {
                line: self.line(),
                message: "expected an indented block".to_owned(),
            });
        }
        Ok(body)
    }

    // Expression grammar, lowest precedence first.

    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.or_test()
    }

    fn or_test(&mut self) -> Result<Expr, ParseError> {
        let first = self.and_test()?;
        if !self.check(&Tok::Or) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(&Tok::Or) {
            values.push(self.and_test()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOpKind::Or,
            values,
        })
    }

    fn and_test(&mut self) -> Result<Expr, ParseError> {
        let first = self.not_test()?;
        if !self.check(&Tok::And) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(&Tok::And) {
            values.push(self.not_test()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOpKind::And,
            values,
        })
    }

    fn not_test(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Tok::Not) {
            return Ok(Expr::Not(Box::new(self.not_test()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.arith()?;
        let mut chained: Vec<Expr> = Vec::new();

        loop {
            let line = self.line();
            let op = match self.peek() {
                Tok::EqEq => CmpOp::Eq,
                Tok::NotEq => CmpOp::NotEq,
                Tok::Lt => CmpOp::Lt,
                Tok::LtEq => CmpOp::LtEq,
                Tok::Gt => CmpOp::Gt,
                Tok::GtEq => CmpOp::GtEq,
                Tok::In => CmpOp::In,
                Tok::Not => {
                    // `not in`
                    self.advance();
                    self.expect(&Tok::In)?;
                    let right = self.arith()?;
                    chained.push(Expr::Compare {
                        op: CmpOp::NotIn,
                        left: Box::new(left.clone()),
                        right: Box::new(right.clone()),
                        line,
                    });
                    left = right;
                    continue;
                }
                _ => break,
            };
            self.advance();
            let right = self.arith()?;
            chained.push(Expr::Compare {
                op,
                left: Box::new(left.clone()),
                right: Box::new(right.clone()),
                line,
            });
            left = right;
        }

        match chained.len() {
            0 => Ok(left),
            1 => Ok(chained.remove(0)),
            // a < b < c is sugar for (a < b) and (b < c)
            _ => Ok(Expr::BoolOp {
                op: BoolOpKind::And,
                values: chained,
            }),
        }
    }

    fn arith(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.term()?;
        loop {
            let line = self.line();
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                line,
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.factor()?;
        loop {
            let line = self.line();
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::DoubleSlash => BinOp::FloorDiv,
                Tok::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.factor()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                line,
            };
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Tok::Minus) {
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(self.factor()?),
            });
        }
        if self.eat(&Tok::Plus) {
            return Ok(Expr::Unary {
                op: UnaryOp::Pos,
                operand: Box::new(self.factor()?),
            });
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, ParseError> {
        let base = self.postfix()?;
        if self.check(&Tok::DoubleStar) {
            let line = self.line();
            self.advance();
            // exponentiation is right-associative
            let exponent = self.factor()?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
                line,
            });
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.atom()?;
        loop {
            let line = self.line();
            match self.peek() {
                Tok::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(&Tok::RParen) {
                        args.push(self.expression()?);
                        while self.eat(&Tok::Comma) {
                            if self.check(&Tok::RParen) {
                                break;
                            }
                            args.push(self.expression()?);
                        }
                    }
                    self.expect(&Tok::RParen)?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        line,
                    };
                }
                Tok::LBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(&Tok::RBracket)?;
                    expr = Expr::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                        line,
                    };
                }
                Tok::Dot => {
                    self.advance();
                    let attr = self.name()?;
                    expr = Expr::Attribute {
                        value: Box::new(expr),
                        attr,
                        line,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn atom(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let tok = self.peek().clone();
        match tok {
            Tok::Int(value) => {
                self.advance();
                Ok(Expr::Int(value))
            }
            Tok::Float(value) => {
                self.advance();
                Ok(Expr::Float(value))
            }
            Tok::Str(value) => {
                self.advance();
                Ok(Expr::Str(value))
            }
            Tok::True => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            Tok::False => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            Tok::NoneKw => {
                self.advance();
                Ok(Expr::NoneLit)
            }
            Tok::Name(name) => {
                self.advance();
                Ok(Expr::Name(name))
            }
            Tok::LParen => {
                self.advance();
                let expr = self.expression()?;
                self.expect(&Tok::RParen)?;
                Ok(expr)
            }
            Tok::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&Tok::RBracket) {
                    items.push(self.expression()?);
                    while self.eat(&Tok::Comma) {
                        if self.check(&Tok::RBracket) {
                            break;
                        }
                        items.push(self.expression()?);
                    }
                }
                self.expect(&Tok::RBracket)?;
                Ok(Expr::List(items))
            }
            Tok::LBrace => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&Tok::RBrace) {
                    loop {
                        let key = self.expression()?;
                        self.expect(&Tok::Colon)?;
                        let value = self.expression()?;
                        items.push((key, value));
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                        if self.check(&Tok::RBrace) {
                            break;
                        }
                    }
                }
                self.expect(&Tok::RBrace)?;
                Ok(Expr::Dict(items))
            }
            other => Err(ParseError {
                line,
                message: format!("unexpected {other}"),
            }),
        }
    }

    // Token-stream helpers.

    fn dotted_name(&mut self) -> Result<String, ParseError> {
        let mut name = self.name()?;
        while self.eat(&Tok::Dot) {
            name.push('.');
            name.push_str(&self.name()?);
        }
        Ok(name)
    }

    fn name(&mut self) -> Result<String, ParseError> {
        match self.peek().clone() {
            Tok::Name(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(ParseError {
                line: self.line(),
                message: format!("expected a name, found {other}"),
            }),
        }
    }

    fn expect_newline(&mut self) -> Result<(), ParseError> {
        if self.eat(&Tok::Newline) || self.check(&Tok::Eof) {
            return Ok(());
        }
        Err(ParseError {
            line: self.line(),
            message: format!("unexpected {} after statement", self.peek()),
        })
    }

    fn expect(&mut self, expected: &Tok) -> Result<(), ParseError> {
        if self.eat(expected) {
            return Ok(());
        }
        Err(ParseError {
            line: self.line(),
            message: format!("expected {expected}, found {}", self.peek()),
        })
    }

    fn eat(&mut self, expected: &Tok) -> bool {
        if self.check(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn check(&self, expected: &Tok) -> bool {
        self.peek() == expected
    }

    fn peek(&self) -> &Tok {
        static EOF: Tok = Tok::Eof;
        self.tokens
            .get(self.pos)
            .map(|spanned| &spanned.tok)
            .unwrap_or(&EOF)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|spanned| spanned.line)
            .unwrap_or(0)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_column_assignment() {
        let program = parse("df[\"total\"] = df[\"price\"] * df[\"qty\"]\n").unwrap();
        assert_eq!(program.body.len(), 1);
        match &program.body[0] {
            Stmt::Assign {
                target: Target::Subscript { .. },
                value: Expr::Binary { op: BinOp::Mul, .. },
                ..
            } => {}
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn test_parses_semicolon_separated_statements() {
        let program = parse("df[\"t\"] = 1; return df\n").unwrap();
        assert_eq!(program.body.len(), 2);
        assert!(matches!(program.body[1], Stmt::Return { .. }));
    }

    #[test]
    fn test_parses_transform_definition() {
        let source = "def transform(df):\n    df[\"x\"] = 1\n    return df\n";
        let program = parse(source).unwrap();
        match &program.body[0] {
            Stmt::FunctionDef { name, params, body, .. } => {
                assert_eq!(name, "transform");
                assert_eq!(params, &["df"]);
                assert_eq!(body.len(), 2);
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn test_parses_inline_while_suite() {
        let program = parse("while True: pass\n").unwrap();
        match &program.body[0] {
            Stmt::While { test: Expr::Bool(true), body, .. } => {
                assert!(matches!(body[0], Stmt::Pass { .. }));
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn test_parses_elif_chain() {
        let source = "if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n";
        let program = parse(source).unwrap();
        match &program.body[0] {
            Stmt::If { orelse, .. } => {
                assert_eq!(orelse.len(), 1);
                assert!(matches!(orelse[0], Stmt::If { .. }));
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn test_parses_for_with_unpack() {
        let program = parse("for k, v in items:\n    x = k\n").unwrap();
        match &program.body[0] {
            Stmt::For { targets, .. } => assert_eq!(targets, &["k", "v"]),
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn test_comparison_chain_desugars_to_and() {
        let program = parse("x = 1 < y < 10\n").unwrap();
        match &program.body[0] {
            Stmt::Assign {
                value: Expr::BoolOp { op: BoolOpKind::And, values },
                ..
            } => assert_eq!(values.len(), 2),
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn test_import_forms() {
        let program = parse("import numpy as np\nfrom math import sqrt, floor\n").unwrap();
        assert!(matches!(
            &program.body[0],
            Stmt::Import { module, alias: Some(alias), .. } if module == "numpy" && alias == "np"
        ));
        assert!(matches!(
            &program.body[1],
            Stmt::FromImport { module, names, .. } if module == "math" && names.len() == 2
        ));
    }

    #[test]
    fn test_attribute_assignment_is_rejected() {
        let error = parse("df.x = 1\n").unwrap_err();
        assert!(error.message.contains("attribute assignment"));
    }

    #[test]
    fn test_class_definitions_do_not_parse() {
        assert!(parse("class Foo:\n    pass\n").is_err());
    }

    #[test]
    fn test_lambda_does_not_parse() {
        assert!(parse("f = lambda x: x\n").is_err());
    }

    #[test]
    fn test_augmented_assignment_operators() {
        for (source, expected) in [
            ("x += 1\n", BinOp::Add),
            ("x -= 1\n", BinOp::Sub),
            ("x *= 2\n", BinOp::Mul),
            ("x /= 2\n", BinOp::Div),
            ("x //= 2\n", BinOp::FloorDiv),
            ("x %= 2\n", BinOp::Mod),
            ("x **= 2\n", BinOp::Pow),
        ] {
            let program = parse(source).unwrap();
            match &program.body[0] {
                Stmt::AugAssign { op, .. } => assert_eq!(*op, expected),
                other => panic!("unexpected statement for {source:?}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_precedence_of_mul_over_add() {
        let program = parse("x = 1 + 2 * 3\n").unwrap();
        match &program.body[0] {
            Stmt::Assign {
                value: Expr::Binary { op: BinOp::Add, right, .. },
                ..
            } => assert!(matches!(**right, Expr::Binary { op: BinOp::Mul, .. })),
            other => panic!("unexpected statement: {other:?}"),
        }
    }
}
