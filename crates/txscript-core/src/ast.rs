//! Syntax tree produced by the [`parser`](crate::parser).
//!
//! The tree is plain owned data with no back references. A loaded script is
//! wrapped in an `Arc<Program>` and shared read-only by every task of a run.

/// Source position of a node (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos {
    pub line: usize,
    pub column: usize,
}

impl Pos {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub functions: Vec<FunctionDecl>,
    pub receive_handlers: Vec<ReceiveHandler>,
    pub interval_handlers: Vec<IntervalHandler>,
    pub statements: Vec<Statement>,
}

impl Program {
    pub fn function(&self, name: &str) -> Option<&FunctionDecl> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn has_handlers(&self) -> bool {
        !self.receive_handlers.is_empty() || !self.interval_handlers.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Statement>,
    pub pos: Pos,
}

/// `on_receive(<predicate>) { ... }`
#[derive(Debug, Clone)]
pub struct ReceiveHandler {
    pub predicate: Expression,
    pub body: Vec<Statement>,
    pub pos: Pos,
}

/// `on_interval(<ms>) { ... }`
#[derive(Debug, Clone)]
pub struct IntervalHandler {
    pub period: Expression,
    pub body: Vec<Statement>,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub struct Statement {
    pub kind: StatementKind,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub enum StatementKind {
    VarDecl {
        name: String,
        value: Option<Expression>,
    },
    Assign {
        name: String,
        op: AssignOp,
        value: Expression,
    },
    Send {
        id: Expression,
        data: Vec<Expression>,
        extended: Option<Expression>,
    },
    Delay(Expression),
    Repeat {
        count: Expression,
        body: Vec<Statement>,
    },
    Loop {
        body: Vec<Statement>,
    },
    If {
        condition: Expression,
        then_block: Vec<Statement>,
        else_block: Option<Vec<Statement>>,
    },
    WaitFor {
        predicate: Expression,
        timeout: Expression,
        fallback: Option<Vec<Statement>>,
    },
    /// Only legal at top level; the parser hoists it into [`Program::functions`].
    FunctionDecl(FunctionDecl),
    Return(Option<Expression>),
    Break,
    Continue,
    Print(Expression),
    Expr(Expression),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOp {
    /// The binary operator a compound assignment applies, if any.
    pub fn binary(self) -> Option<BinaryOp> {
        match self {
            AssignOp::Set => None,
            AssignOp::Add => Some(BinaryOp::Add),
            AssignOp::Sub => Some(BinaryOp::Sub),
            AssignOp::Mul => Some(BinaryOp::Mul),
            AssignOp::Div => Some(BinaryOp::Div),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Expression {
    pub kind: ExprKind,
    pub pos: Pos,
}

impl Expression {
    pub fn new(kind: ExprKind, pos: Pos) -> Self {
        Self { kind, pos }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Literal),
    Identifier(String),
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Ternary {
        condition: Box<Expression>,
        then_branch: Box<Expression>,
        else_branch: Box<Expression>,
    },
    Call {
        callee: Box<Expression>,
        args: Vec<Expression>,
    },
    RandomCall {
        min: Box<Expression>,
        max: Box<Expression>,
    },
    RandomBytesCall {
        len: Box<Expression>,
    },
    Index {
        target: Box<Expression>,
        index: Box<Expression>,
    },
    Member {
        target: Box<Expression>,
        field: String,
    },
    /// `[a, b, c]`, evaluated to a byte string.
    ByteList(Vec<Expression>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    /// A `500s` literal, already converted to milliseconds.
    Millis(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::BitAnd => "&",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    BitNot,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Not => "!",
            UnaryOp::Neg => "-",
            UnaryOp::BitNot => "~",
        }
    }
}
