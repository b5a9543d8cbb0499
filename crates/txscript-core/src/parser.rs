//! Recursive-descent parser with error recovery.
//!
//! A failing statement records a PARSE diagnostic and the parser skips ahead
//! to the next statement boundary: a token on a later line, a `;`, or a `}`.
//! Brace groups opened on the failing line are skipped whole so one bad
//! header does not unbalance the rest of the script.

use crate::ast::*;
use crate::error::{ErrorKind, ScriptError};
use crate::lexer::{tokenize, Token, TokenKind};

type PResult<T> = Result<T, ScriptError>;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<ScriptError>,
    loop_depth: usize,
    /// Inside a function or handler body, where `return` is legal.
    in_body: bool,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        // Error tokens were already reported by the lexer.
        let mut tokens: Vec<Token> = tokens.into_iter().filter(|t| t.kind != TokenKind::Error).collect();
        if tokens.last().map_or(true, |t| t.kind != TokenKind::Eof) {
            let (line, column) = tokens.last().map_or((1, 1), |t| (t.line, t.column));
            tokens.push(Token { kind: TokenKind::Eof, text: String::new(), line, column });
        }
        Self { tokens, pos: 0, errors: Vec::new(), loop_depth: 0, in_body: false }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn peek_next_kind(&self) -> TokenKind {
        self.tokens.get(self.pos + 1).map_or(TokenKind::Eof, |t| t.kind)
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos.saturating_sub(1)]
    }

    fn pos_here(&self) -> Pos {
        let t = self.peek();
        Pos::new(t.line, t.column)
    }

    fn at_end(&self) -> bool {
        self.peek_kind() == TokenKind::Eof
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if !self.at_end() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_here(&self, kind: ErrorKind, message: impl Into<String>) -> ScriptError {
        let t = self.peek();
        ScriptError::parse(kind, message, t.line, t.column)
    }

    fn unexpected(&self, expected: &str) -> ScriptError {
        let t = self.peek();
        let kind = if t.kind == TokenKind::Eof { ErrorKind::MissingTerminator } else { ErrorKind::UnexpectedToken };
        let found = if t.kind == TokenKind::Eof { "end of input".to_string() } else { format!("'{}'", t.text) };
        ScriptError::parse(kind, format!("Expected {}, found {}", expected, found), t.line, t.column)
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> PResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_identifier(&mut self, expected: &str) -> PResult<String> {
        Ok(self.expect(TokenKind::Identifier, expected)?.text)
    }

    /// Skips to the next statement boundary after an error in a statement
    /// that started on `line`.
    fn synchronize(&mut self, line: usize) {
        let mut depth = 0usize;
        loop {
            let t = self.peek();
            match t.kind {
                TokenKind::Eof => return,
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace if depth > 0 => {
                    depth -= 1;
                    if depth == 0 {
                        self.advance();
                        return;
                    }
                }
                TokenKind::RBrace => return,
                TokenKind::Semicolon if depth == 0 => {
                    self.advance();
                    return;
                }
                _ if depth == 0 && t.line > line => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ── Program structure ─────────────────────────────────────────────────

    fn parse_program(&mut self) -> Program {
        let mut program = Program::default();

        while !self.at_end() {
            if self.eat(TokenKind::Semicolon) {
                continue;
            }
            if self.check(TokenKind::RBrace) {
                let err = self.error_here(ErrorKind::UnbalancedBlock, "Unmatched '}'");
                self.errors.push(err);
                self.advance();
                continue;
            }

            let start_line = self.peek().line;
            let result = match self.peek_kind() {
                TokenKind::OnReceive => self.parse_on_receive().map(|h| program.receive_handlers.push(h)),
                TokenKind::OnInterval => self.parse_on_interval().map(|h| program.interval_handlers.push(h)),
                _ => self.parse_statement().map(|stmt| match stmt.kind {
                    StatementKind::FunctionDecl(decl) => program.functions.push(decl),
                    _ => program.statements.push(stmt),
                }),
            };

            if let Err(e) = result {
                self.errors.push(e);
                self.synchronize(start_line);
            }
        }

        self.check_duplicate_functions(&program);
        program
    }

    fn check_duplicate_functions(&mut self, program: &Program) {
        for (i, f) in program.functions.iter().enumerate() {
            if program.functions[..i].iter().any(|g| g.name == f.name) {
                self.errors.push(ScriptError::parse(
                    ErrorKind::MisplacedDeclaration,
                    format!("Function '{}' is already defined", f.name),
                    f.pos.line,
                    f.pos.column,
                ));
            }
        }
    }

    /// Parses a `{ ... }` block, recovering from errors in its statements.
    fn parse_block(&mut self) -> PResult<Vec<Statement>> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut stmts = Vec::new();

        loop {
            if self.eat(TokenKind::RBrace) {
                return Ok(stmts);
            }
            if self.at_end() {
                return Err(self.error_here(ErrorKind::UnbalancedBlock, "Unclosed block, expected '}'"));
            }
            if self.eat(TokenKind::Semicolon) {
                continue;
            }

            let start_line = self.peek().line;
            match self.parse_statement() {
                Ok(Statement { kind: StatementKind::FunctionDecl(decl), .. }) => {
                    self.errors.push(ScriptError::parse(
                        ErrorKind::MisplacedDeclaration,
                        format!("Function '{}' must be declared at top level", decl.name),
                        decl.pos.line,
                        decl.pos.column,
                    ));
                }
                Ok(stmt) => stmts.push(stmt),
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize(start_line);
                }
            }
        }
    }

    /// Loop bodies are blocks with `break`/`continue` enabled.
    fn parse_loop_body(&mut self) -> PResult<Vec<Statement>> {
        self.loop_depth += 1;
        let body = self.parse_block();
        self.loop_depth -= 1;
        body
    }

    /// Function and handler bodies: `return` is legal, enclosing loops are not visible.
    fn parse_callable_body(&mut self) -> PResult<Vec<Statement>> {
        let saved_loop_depth = std::mem::replace(&mut self.loop_depth, 0);
        let saved_in_body = std::mem::replace(&mut self.in_body, true);
        let body = self.parse_block();
        self.loop_depth = saved_loop_depth;
        self.in_body = saved_in_body;
        body
    }

    /// Either a braced block or a single statement (for `if`/`else`).
    fn parse_branch(&mut self) -> PResult<Vec<Statement>> {
        if self.check(TokenKind::LBrace) {
            return self.parse_block();
        }
        let stmt = self.parse_statement()?;
        if let StatementKind::FunctionDecl(decl) = &stmt.kind {
            return Err(ScriptError::parse(
                ErrorKind::MisplacedDeclaration,
                format!("Function '{}' must be declared at top level", decl.name),
                stmt.pos.line,
                stmt.pos.column,
            ));
        }
        Ok(vec![stmt])
    }

    fn parse_on_receive(&mut self) -> PResult<ReceiveHandler> {
        let pos = self.pos_here();
        self.advance();
        self.expect(TokenKind::LParen, "'(' after 'on_receive'")?;
        let predicate = self.parse_expression()?;
        self.expect(TokenKind::RParen, "')' after receive predicate")?;
        let body = self.parse_callable_body()?;
        Ok(ReceiveHandler { predicate, body, pos })
    }

    fn parse_on_interval(&mut self) -> PResult<IntervalHandler> {
        let pos = self.pos_here();
        self.advance();
        self.expect(TokenKind::LParen, "'(' after 'on_interval'")?;
        let period = self.parse_expression()?;
        self.expect(TokenKind::RParen, "')' after interval period")?;
        let body = self.parse_callable_body()?;
        Ok(IntervalHandler { period, body, pos })
    }

    // ── Statements ────────────────────────────────────────────────────────

    fn parse_statement(&mut self) -> PResult<Statement> {
        let pos = self.pos_here();
        let kind = match self.peek_kind() {
            TokenKind::Var => self.parse_var()?,
            TokenKind::Send => self.parse_send()?,
            TokenKind::Delay => {
                self.advance();
                StatementKind::Delay(self.parse_expression()?)
            }
            TokenKind::Repeat => {
                self.advance();
                let count = self.parse_expression()?;
                let body = self.parse_loop_body()?;
                StatementKind::Repeat { count, body }
            }
            TokenKind::Loop => {
                self.advance();
                let body = self.parse_loop_body()?;
                StatementKind::Loop { body }
            }
            TokenKind::If => self.parse_if()?,
            TokenKind::WaitFor => self.parse_wait_for()?,
            TokenKind::Function => StatementKind::FunctionDecl(self.parse_function()?),
            TokenKind::Return => self.parse_return()?,
            TokenKind::Break | TokenKind::Continue => {
                let token = self.advance();
                if self.loop_depth == 0 {
                    return Err(ScriptError::parse(
                        ErrorKind::MisplacedJump,
                        format!("'{}' outside of a loop", token.text),
                        token.line,
                        token.column,
                    ));
                }
                if token.kind == TokenKind::Break {
                    StatementKind::Break
                } else {
                    StatementKind::Continue
                }
            }
            TokenKind::Print => {
                self.advance();
                StatementKind::Print(self.parse_expression()?)
            }
            TokenKind::OnReceive | TokenKind::OnInterval => {
                return Err(self.error_here(
                    ErrorKind::MisplacedDeclaration,
                    format!("'{}' handlers must be declared at top level", self.peek().text),
                ));
            }
            TokenKind::Identifier if is_assign_op(self.peek_next_kind()) => self.parse_assign()?,
            _ => StatementKind::Expr(self.parse_expression()?),
        };
        self.eat(TokenKind::Semicolon);
        Ok(Statement { kind, pos })
    }

    fn parse_var(&mut self) -> PResult<StatementKind> {
        self.advance();
        let name = self.expect_identifier("variable name after 'var'")?;
        let value = if self.eat(TokenKind::Assign) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Ok(StatementKind::VarDecl { name, value })
    }

    fn parse_assign(&mut self) -> PResult<StatementKind> {
        let name = self.advance().text;
        let op = match self.advance().kind {
            TokenKind::PlusAssign => AssignOp::Add,
            TokenKind::MinusAssign => AssignOp::Sub,
            TokenKind::StarAssign => AssignOp::Mul,
            TokenKind::SlashAssign => AssignOp::Div,
            _ => AssignOp::Set,
        };
        let value = self.parse_expression()?;
        Ok(StatementKind::Assign { name, op, value })
    }

    /// `send(id, byte-or-bytes..., [ext])`
    fn parse_send(&mut self) -> PResult<StatementKind> {
        self.advance();
        self.expect(TokenKind::LParen, "'(' after 'send'")?;
        let id = self.parse_expression()?;
        let mut data = Vec::new();
        let mut extended = None;

        while self.eat(TokenKind::Comma) {
            if self.check(TokenKind::Ext) && self.peek_next_kind() == TokenKind::RParen {
                let t = self.advance();
                extended = Some(Expression::new(ExprKind::Literal(Literal::Bool(true)), Pos::new(t.line, t.column)));
                break;
            }
            data.push(self.parse_expression()?);
        }

        self.expect(TokenKind::RParen, "')' after send arguments")?;
        Ok(StatementKind::Send { id, data, extended })
    }

    fn parse_if(&mut self) -> PResult<StatementKind> {
        self.advance();
        let condition = self.parse_expression()?;
        let then_block = self.parse_branch()?;
        // `else` attaches to the innermost `if` still being parsed.
        let else_block = if self.eat(TokenKind::Else) {
            Some(self.parse_branch()?)
        } else {
            None
        };
        Ok(StatementKind::If { condition, then_block, else_block })
    }

    /// `wait_for(<predicate>) timeout(<ms>) { <fallback> }?`
    fn parse_wait_for(&mut self) -> PResult<StatementKind> {
        self.advance();
        self.expect(TokenKind::LParen, "'(' after 'wait_for'")?;
        let predicate = self.parse_expression()?;
        self.expect(TokenKind::RParen, "')' after wait_for predicate")?;
        if !self.check(TokenKind::Timeout) {
            let mut err = self.unexpected("'timeout(<ms>)' clause after wait_for");
            err.kind = ErrorKind::MissingTerminator;
            return Err(err);
        }
        self.advance();
        self.expect(TokenKind::LParen, "'(' after 'timeout'")?;
        let timeout = self.parse_expression()?;
        self.expect(TokenKind::RParen, "')' after timeout")?;
        let fallback = if self.check(TokenKind::LBrace) {
            Some(self.parse_block()?)
        } else {
            None
        };
        Ok(StatementKind::WaitFor { predicate, timeout, fallback })
    }

    fn parse_function(&mut self) -> PResult<FunctionDecl> {
        let pos = self.pos_here();
        self.advance();
        let name = self.expect_identifier("function name")?;
        self.expect(TokenKind::LParen, "'(' after function name")?;
        let mut params: Vec<String> = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                let t = self.peek().clone();
                let param = self.expect_identifier("parameter name")?;
                if params.contains(&param) {
                    return Err(ScriptError::parse(
                        ErrorKind::UnexpectedToken,
                        format!("Duplicate parameter '{}'", param),
                        t.line,
                        t.column,
                    ));
                }
                params.push(param);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')' after parameters")?;
        let body = self.parse_callable_body()?;
        Ok(FunctionDecl { name, params, body, pos })
    }

    fn parse_return(&mut self) -> PResult<StatementKind> {
        let token = self.advance();
        if !self.in_body {
            return Err(ScriptError::parse(
                ErrorKind::MisplacedJump,
                "'return' outside of a function or handler",
                token.line,
                token.column,
            ));
        }
        let next = self.peek();
        let ends_here = matches!(next.kind, TokenKind::RBrace | TokenKind::Semicolon | TokenKind::Eof)
            || next.line > token.line;
        if ends_here {
            Ok(StatementKind::Return(None))
        } else {
            Ok(StatementKind::Return(Some(self.parse_expression()?)))
        }
    }

    // ── Expressions ───────────────────────────────────────────────────────

    fn parse_expression(&mut self) -> PResult<Expression> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> PResult<Expression> {
        let condition = self.parse_binary(0)?;
        if !self.check(TokenKind::Question) {
            return Ok(condition);
        }
        let pos = self.pos_here();
        self.advance();
        let then_branch = self.parse_ternary()?;
        self.expect(TokenKind::Colon, "':' in conditional expression")?;
        let else_branch = self.parse_ternary()?;
        Ok(Expression::new(
            ExprKind::Ternary {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            },
            pos,
        ))
    }

    /// Left-associative binary levels, lowest precedence first.
    fn parse_binary(&mut self, level: usize) -> PResult<Expression> {
        if level >= BINARY_LEVELS.len() {
            return self.parse_unary();
        }
        let mut left = self.parse_binary(level + 1)?;
        loop {
            let kind = self.peek_kind();
            let op = match BINARY_LEVELS[level].iter().find(|(k, _)| *k == kind) {
                Some((_, op)) => *op,
                None => return Ok(left),
            };
            let pos = self.pos_here();
            self.advance();
            let right = self.parse_binary(level + 1)?;
            left = Expression::new(
                ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) },
                pos,
            );
        }
    }

    fn parse_unary(&mut self) -> PResult<Expression> {
        let op = match self.peek_kind() {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Tilde => UnaryOp::BitNot,
            _ => return self.parse_postfix(),
        };
        let pos = self.pos_here();
        self.advance();
        let operand = self.parse_unary()?;
        Ok(Expression::new(ExprKind::Unary { op, operand: Box::new(operand) }, pos))
    }

    /// Calls and indexing must open on the same line as the expression they
    /// apply to, so a parenthesized statement on the next line is not
    /// swallowed as an argument list.
    fn parse_postfix(&mut self) -> PResult<Expression> {
        let mut expr = self.parse_primary()?;
        loop {
            let same_line = self.peek().line == self.previous().line;
            match self.peek_kind() {
                TokenKind::LParen if same_line => {
                    let pos = self.pos_here();
                    self.advance();
                    let args = self.parse_arguments(TokenKind::RParen, "')' after arguments")?;
                    expr = Expression::new(ExprKind::Call { callee: Box::new(expr), args }, pos);
                }
                TokenKind::LBracket if same_line => {
                    let pos = self.pos_here();
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(TokenKind::RBracket, "']' after index")?;
                    expr = Expression::new(
                        ExprKind::Index { target: Box::new(expr), index: Box::new(index) },
                        pos,
                    );
                }
                TokenKind::Dot => {
                    let pos = self.pos_here();
                    self.advance();
                    let field = self.parse_member_name()?;
                    expr = Expression::new(ExprKind::Member { target: Box::new(expr), field }, pos);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_member_name(&mut self) -> PResult<String> {
        match self.peek_kind() {
            TokenKind::Identifier | TokenKind::Data | TokenKind::Ext => Ok(self.advance().text),
            _ => Err(self.unexpected("member name after '.'")),
        }
    }

    fn parse_arguments(&mut self, close: TokenKind, expected: &str) -> PResult<Vec<Expression>> {
        let mut args = Vec::new();
        if !self.check(close) {
            loop {
                args.push(self.parse_expression()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(close, expected)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> PResult<Expression> {
        let pos = self.pos_here();
        let literal = |lit: Literal| -> PResult<Expression> { Ok(Expression::new(ExprKind::Literal(lit), pos)) };
        match self.peek_kind() {
            TokenKind::Number => {
                let t = self.advance();
                literal(Literal::Int(parse_int(&t.text, 10, &t)?))
            }
            TokenKind::HexNumber => {
                let t = self.advance();
                literal(Literal::Int(parse_int(&t.text[2..], 16, &t)?))
            }
            TokenKind::TimeLiteral => {
                let t = self.advance();
                let seconds = parse_int(&t.text[..t.text.len() - 1], 10, &t)?;
                let millis = seconds.checked_mul(1000).ok_or_else(|| {
                    ScriptError::parse(ErrorKind::InvalidNumber, "Time literal out of range", t.line, t.column)
                })?;
                literal(Literal::Millis(millis))
            }
            TokenKind::Float => {
                let t = self.advance();
                let value: f64 = t.text.parse().map_err(|_| {
                    ScriptError::parse(ErrorKind::InvalidNumber, format!("Invalid float: {}", t.text), t.line, t.column)
                })?;
                literal(Literal::Float(value))
            }
            TokenKind::String => literal(Literal::String(self.advance().text)),
            TokenKind::True => {
                self.advance();
                literal(Literal::Bool(true))
            }
            TokenKind::False => {
                self.advance();
                literal(Literal::Bool(false))
            }
            // Frame fields are keywords but read like variables.
            TokenKind::Identifier | TokenKind::Data | TokenKind::Ext => {
                Ok(Expression::new(ExprKind::Identifier(self.advance().text), pos))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expression()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                self.advance();
                let items = self.parse_arguments(TokenKind::RBracket, "']' after byte list")?;
                Ok(Expression::new(ExprKind::ByteList(items), pos))
            }
            TokenKind::Random => {
                self.advance();
                self.expect(TokenKind::LParen, "'(' after 'random'")?;
                let min = self.parse_expression()?;
                self.expect(TokenKind::Comma, "',' between random bounds")?;
                let max = self.parse_expression()?;
                self.expect(TokenKind::RParen, "')' after random bounds")?;
                Ok(Expression::new(ExprKind::RandomCall { min: Box::new(min), max: Box::new(max) }, pos))
            }
            TokenKind::RandomBytes => {
                self.advance();
                self.expect(TokenKind::LParen, "'(' after 'random_bytes'")?;
                let len = self.parse_expression()?;
                self.expect(TokenKind::RParen, "')' after random_bytes length")?;
                Ok(Expression::new(ExprKind::RandomBytesCall { len: Box::new(len) }, pos))
            }
            _ => Err(self.unexpected("expression")),
        }
    }
}

const BINARY_LEVELS: &[&[(TokenKind, BinaryOp)]] = &[
    &[(TokenKind::PipePipe, BinaryOp::Or)],
    &[(TokenKind::AmpAmp, BinaryOp::And)],
    &[(TokenKind::Pipe, BinaryOp::BitOr)],
    &[(TokenKind::Caret, BinaryOp::BitXor)],
    &[(TokenKind::Amp, BinaryOp::BitAnd)],
    &[(TokenKind::EqEq, BinaryOp::Eq), (TokenKind::NotEq, BinaryOp::NotEq)],
    &[
        (TokenKind::Lt, BinaryOp::Lt),
        (TokenKind::Le, BinaryOp::Le),
        (TokenKind::Gt, BinaryOp::Gt),
        (TokenKind::Ge, BinaryOp::Ge),
    ],
    &[(TokenKind::Shl, BinaryOp::Shl), (TokenKind::Shr, BinaryOp::Shr)],
    &[(TokenKind::Plus, BinaryOp::Add), (TokenKind::Minus, BinaryOp::Sub)],
    &[(TokenKind::Star, BinaryOp::Mul), (TokenKind::Slash, BinaryOp::Div), (TokenKind::Percent, BinaryOp::Rem)],
];

fn is_assign_op(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Assign
            | TokenKind::PlusAssign
            | TokenKind::MinusAssign
            | TokenKind::StarAssign
            | TokenKind::SlashAssign
    )
}

fn parse_int(digits: &str, radix: u32, token: &Token) -> PResult<i64> {
    i64::from_str_radix(digits, radix).map_err(|_| {
        ScriptError::parse(
            ErrorKind::InvalidNumber,
            format!("Integer literal out of range: {}", token.text),
            token.line,
            token.column,
        )
    })
}

/// Parses a token stream into a [`Program`], collecting every PARSE error.
pub fn parse(tokens: Vec<Token>) -> (Program, Vec<ScriptError>) {
    let mut parser = Parser::new(tokens);
    let program = parser.parse_program();
    (program, parser.errors)
}

/// Lexes and parses `source`. LEX errors come first, then PARSE errors.
pub fn parse_source(source: &str) -> (Program, Vec<ScriptError>) {
    let (tokens, mut errors) = tokenize(source);
    let (program, parse_errors) = parse(tokens);
    errors.extend(parse_errors);
    (program, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Phase;

    fn parse_ok(source: &str) -> Program {
        let (program, errors) = parse_source(source);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        program
    }

    fn parse_errors(source: &str) -> Vec<ScriptError> {
        parse_source(source).1
    }

    #[test]
    fn test_parse_var_and_send() {
        let program = parse_ok("var x = 5; send(0x100, x)");
        assert_eq!(program.statements.len(), 2);
        match &program.statements[1].kind {
            StatementKind::Send { id, data, extended } => {
                assert!(matches!(id.kind, ExprKind::Literal(Literal::Int(256))));
                assert_eq!(data.len(), 1);
                assert!(matches!(&data[0].kind, ExprKind::Identifier(n) if n == "x"));
                assert!(extended.is_none());
            }
            other => panic!("Expected Send, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_send_with_ext_flag() {
        let program = parse_ok("send(0x18DAF110, 0x02, 0x10, ext)");
        match &program.statements[0].kind {
            StatementKind::Send { data, extended, .. } => {
                assert_eq!(data.len(), 2);
                assert!(matches!(
                    extended.as_ref().map(|e| &e.kind),
                    Some(ExprKind::Literal(Literal::Bool(true)))
                ));
            }
            other => panic!("Expected Send, got {:?}", other),
        }
    }

    #[test]
    fn test_statements_without_separators() {
        let program = parse_ok("var x = 0\nloop { if (x > 10) { break } x = x + 1 }");
        match &program.statements[1].kind {
            StatementKind::Loop { body } => {
                assert_eq!(body.len(), 2);
                assert!(matches!(body[0].kind, StatementKind::If { .. }));
                assert!(matches!(body[1].kind, StatementKind::Assign { op: AssignOp::Set, .. }));
            }
            other => panic!("Expected Loop, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let program = parse_ok("var y = 1 + 2 * 3");
        match &program.statements[0].kind {
            StatementKind::VarDecl { value: Some(expr), .. } => match &expr.kind {
                ExprKind::Binary { op: BinaryOp::Add, right, .. } => {
                    assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
                }
                other => panic!("Expected Add at root, got {:?}", other),
            },
            other => panic!("Expected VarDecl, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence_bitwise_below_equality() {
        // `a & b == c` groups as `a & (b == c)`
        let program = parse_ok("var y = a & b == c");
        match &program.statements[0].kind {
            StatementKind::VarDecl { value: Some(expr), .. } => {
                assert!(matches!(expr.kind, ExprKind::Binary { op: BinaryOp::BitAnd, .. }));
            }
            other => panic!("Expected VarDecl, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence_shift_below_additive() {
        let program = parse_ok("var y = 1 << 2 + 1");
        match &program.statements[0].kind {
            StatementKind::VarDecl { value: Some(expr), .. } => {
                assert!(matches!(expr.kind, ExprKind::Binary { op: BinaryOp::Shl, .. }));
            }
            other => panic!("Expected VarDecl, got {:?}", other),
        }
    }

    #[test]
    fn test_ternary_is_lowest_and_right_associative() {
        let program = parse_ok("var y = a || b ? 1 : c ? 2 : 3");
        match &program.statements[0].kind {
            StatementKind::VarDecl { value: Some(expr), .. } => match &expr.kind {
                ExprKind::Ternary { condition, else_branch, .. } => {
                    assert!(matches!(condition.kind, ExprKind::Binary { op: BinaryOp::Or, .. }));
                    assert!(matches!(else_branch.kind, ExprKind::Ternary { .. }));
                }
                other => panic!("Expected Ternary, got {:?}", other),
            },
            other => panic!("Expected VarDecl, got {:?}", other),
        }
    }

    #[test]
    fn test_unary_binds_tighter_than_binary() {
        let program = parse_ok("var y = -a * ~b");
        match &program.statements[0].kind {
            StatementKind::VarDecl { value: Some(expr), .. } => match &expr.kind {
                ExprKind::Binary { op: BinaryOp::Mul, left, right } => {
                    assert!(matches!(left.kind, ExprKind::Unary { op: UnaryOp::Neg, .. }));
                    assert!(matches!(right.kind, ExprKind::Unary { op: UnaryOp::BitNot, .. }));
                }
                other => panic!("Expected Mul, got {:?}", other),
            },
            other => panic!("Expected VarDecl, got {:?}", other),
        }
    }

    #[test]
    fn test_dangling_else_binds_to_nearest_if() {
        let program = parse_ok("if (a) if (b) print 1 else print 2");
        match &program.statements[0].kind {
            StatementKind::If { then_block, else_block, .. } => {
                assert!(else_block.is_none());
                match &then_block[0].kind {
                    StatementKind::If { else_block, .. } => assert!(else_block.is_some()),
                    other => panic!("Expected inner If, got {:?}", other),
                }
            }
            other => panic!("Expected If, got {:?}", other),
        }
    }

    #[test]
    fn test_else_if_chain() {
        let program = parse_ok("if (a) { print 1 } else if (b) { print 2 } else { print 3 }");
        match &program.statements[0].kind {
            StatementKind::If { else_block: Some(else_block), .. } => {
                assert!(matches!(else_block[0].kind, StatementKind::If { else_block: Some(_), .. }));
            }
            other => panic!("Expected If/else, got {:?}", other),
        }
    }

    #[test]
    fn test_repeat_and_time_literal() {
        let program = parse_ok("repeat(3) { send(0x1, 0x01) delay(2s) }");
        match &program.statements[0].kind {
            StatementKind::Repeat { count, body } => {
                assert!(matches!(count.kind, ExprKind::Literal(Literal::Int(3))));
                match &body[1].kind {
                    StatementKind::Delay(expr) => {
                        assert!(matches!(expr.kind, ExprKind::Literal(Literal::Millis(2000))));
                    }
                    other => panic!("Expected Delay, got {:?}", other),
                }
            }
            other => panic!("Expected Repeat, got {:?}", other),
        }
    }

    #[test]
    fn test_wait_for_with_fallback() {
        let program = parse_ok("wait_for(id == 0x7E8 && data[0] == 0x02) timeout(500) { print \"no reply\" }");
        match &program.statements[0].kind {
            StatementKind::WaitFor { predicate, timeout, fallback } => {
                assert!(matches!(predicate.kind, ExprKind::Binary { op: BinaryOp::And, .. }));
                assert!(matches!(timeout.kind, ExprKind::Literal(Literal::Int(500))));
                assert_eq!(fallback.as_ref().map(Vec::len), Some(1));
            }
            other => panic!("Expected WaitFor, got {:?}", other),
        }
    }

    #[test]
    fn test_wait_for_requires_timeout() {
        let errors = parse_errors("wait_for(id == 1)\nprint 1");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::MissingTerminator);
    }

    #[test]
    fn test_handlers_and_functions_are_collected() {
        let program = parse_ok(
            r#"
function double(v) { return v * 2 }
on_receive(id == 0x100) { print data }
on_interval(100) { send(0x200, 1) }
print double(4)
"#,
        );
        assert_eq!(program.functions.len(), 1);
        assert_eq!(program.functions[0].params, vec!["v".to_string()]);
        assert_eq!(program.receive_handlers.len(), 1);
        assert_eq!(program.interval_handlers.len(), 1);
        assert_eq!(program.statements.len(), 1);
        assert!(program.function("double").is_some());
    }

    #[test]
    fn test_handlers_rejected_inside_blocks() {
        let errors = parse_errors("loop { on_interval(10) { print 1 } break }");
        assert!(errors.iter().any(|e| e.kind == ErrorKind::MisplacedDeclaration));
    }

    #[test]
    fn test_function_rejected_inside_block() {
        let errors = parse_errors("if (true) { function f() { return 1 } }");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::MisplacedDeclaration);
    }

    #[test]
    fn test_break_outside_loop() {
        let errors = parse_errors("break");
        assert_eq!(errors[0].kind, ErrorKind::MisplacedJump);
        // loops do not leak into function bodies
        let errors = parse_errors("loop { function f() { break } }");
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_return_outside_function() {
        let errors = parse_errors("return 1");
        assert_eq!(errors[0].kind, ErrorKind::MisplacedJump);
        assert!(parse_errors("on_interval(5) { return }").is_empty());
    }

    #[test]
    fn test_recovery_reports_all_errors() {
        let errors = parse_errors("var = 1\nsend(0x1, )\nvar ok = 2\nprint )");
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|e| e.phase == Phase::Parse));
        assert_eq!(errors.iter().map(|e| e.line).collect::<Vec<_>>(), vec![1, 2, 4]);
    }

    #[test]
    fn test_recovery_keeps_later_statements() {
        let (program, errors) = parse_source("x = = 1\nvar y = 2");
        assert_eq!(errors.len(), 1);
        assert_eq!(program.statements.len(), 1);
        assert!(matches!(&program.statements[0].kind, StatementKind::VarDecl { name, .. } if name == "y"));
    }

    #[test]
    fn test_recovery_skips_broken_block_header() {
        let (program, errors) = parse_source("if (x == ) {\n  y = 1\n}\nvar z = 3");
        assert_eq!(errors.len(), 1);
        assert_eq!(program.statements.len(), 1);
    }

    #[test]
    fn test_recovery_inside_block() {
        let (program, errors) = parse_source("loop {\n  x = * 2\n  break\n}");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, 2);
        match &program.statements[0].kind {
            StatementKind::Loop { body } => assert!(matches!(body[0].kind, StatementKind::Break)),
            other => panic!("Expected Loop, got {:?}", other),
        }
    }

    #[test]
    fn test_unclosed_block() {
        let errors = parse_errors("loop { send(1, 2)");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::UnbalancedBlock);
    }

    #[test]
    fn test_unmatched_closing_brace() {
        let errors = parse_errors("print 1 }");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::UnbalancedBlock);
    }

    #[test]
    fn test_lex_errors_come_first() {
        let errors = parse_errors("print \"abc");
        assert!(!errors.is_empty());
        assert_eq!(errors[0].phase, Phase::Lex);
    }

    #[test]
    fn test_call_does_not_span_lines() {
        let program = parse_ok("print x\n(y)");
        assert_eq!(program.statements.len(), 2);
    }

    #[test]
    fn test_member_and_index_access() {
        let program = parse_ok("var n = data.length + data[1]");
        match &program.statements[0].kind {
            StatementKind::VarDecl { value: Some(expr), .. } => match &expr.kind {
                ExprKind::Binary { left, right, .. } => {
                    assert!(matches!(&left.kind, ExprKind::Member { field, .. } if field == "length"));
                    assert!(matches!(right.kind, ExprKind::Index { .. }));
                }
                other => panic!("Expected Binary, got {:?}", other),
            },
            other => panic!("Expected VarDecl, got {:?}", other),
        }
    }

    #[test]
    fn test_compound_assignment() {
        let program = parse_ok("var c = 0\nc += 2");
        assert!(matches!(program.statements[1].kind, StatementKind::Assign { op: AssignOp::Add, .. }));
    }

    #[test]
    fn test_integer_overflow_is_parse_error() {
        let errors = parse_errors("var x = 99999999999999999999");
        assert_eq!(errors[0].kind, ErrorKind::InvalidNumber);
    }

    #[test]
    fn test_positions_recorded() {
        let program = parse_ok("var a = 1\n  send(a, 2)");
        assert_eq!(program.statements[1].pos, Pos::new(2, 3));
    }

    #[test]
    fn test_duplicate_function() {
        let errors = parse_errors("function f() { return 1 }\nfunction f() { return 2 }");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, 2);
    }
}
