//! The parser.
//!
//! Recursive descent with precedence climbing for expressions.  Statement
//! dispatch uses fixed k-token lookahead.  Errors are accumulated with
//! their positions and parsing continues until end of input; callers get
//! whatever program was recoverable plus the full error list.
//!
//! Parsing has two side effects on the [CompilerContext]: struct
//! definitions land in the struct table (redefinition is a warning, last
//! definition wins) and function declarations land in the function table,
//! which is pre-seeded with the `alloc`/`free` builtins.

use crate::common::{id, CompilerContext, Diagnostic, ErrorKind, Id, Map, Pos, Set};

use super::ast::*;
use super::lex::{tokenize, Token, TokenKind};

/// What the parser hands back: the recoverable program plus everything
/// that went wrong along the way.
#[derive(Debug)]
pub struct ParseResult {
    pub program: Program,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

pub fn parse(input: &str, ctx: &mut CompilerContext) -> ParseResult {
    let (tokens, errors) = tokenize(input);
    let mut parser = Parser {
        tokens,
        pos: 0,
        ctx,
        errors,
        warnings: Vec::new(),
        scopes: Vec::new(),
        tdz: Set::new(),
    };
    let program = parser.program();
    ParseResult {
        program,
        errors: parser.errors,
        warnings: parser.warnings,
    }
}

struct Parser<'src, 'ctx> {
    tokens: Vec<Token<'src>>,
    pos: usize,
    ctx: &'ctx mut CompilerContext,
    errors: Vec<Diagnostic>,
    warnings: Vec<Diagnostic>,
    /// Lexical scopes for name/type resolution while parsing; innermost
    /// last.
    scopes: Vec<Map<Id, TypeSpec>>,
    /// `let` names of the current function that have not been declared
    /// yet (the temporal dead zone).
    tdz: Set<Id>,
}

impl<'src> Parser<'src, '_> {
    // ---- token plumbing -------------------------------------------------

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn cur(&self) -> Option<Token<'src>> {
        self.tokens.get(self.pos).copied()
    }

    fn kind_at(&self, lookahead: usize) -> Option<TokenKind> {
        self.tokens.get(self.pos + lookahead).map(|t| t.kind())
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.kind_at(0) == Some(kind)
    }

    fn here(&self) -> Pos {
        self.cur()
            .map(|t| t.pos())
            .or_else(|| self.tokens.last().map(|t| t.pos()))
            .unwrap_or_default()
    }

    fn bump(&mut self) -> Option<Token<'src>> {
        let token = self.cur();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> Option<Token<'src>> {
        if self.at(kind) {
            self.bump()
        } else {
            None
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token<'src>, Diagnostic> {
        match self.cur() {
            Some(token) if token.kind() == kind => {
                self.pos += 1;
                Ok(token)
            }
            Some(token) => Err(Diagnostic::at(
                ErrorKind::Parse,
                token.pos(),
                format!("expected '{}', found '{}'", kind, token.text()),
            )),
            None => Err(Diagnostic::at(
                ErrorKind::Parse,
                self.here(),
                format!("expected '{}', found end of input", kind),
            )),
        }
    }

    /// Panic-mode recovery: skip ahead past the next `;` or up to a `}`.
    fn synchronize(&mut self) {
        while let Some(token) = self.cur() {
            match token.kind() {
                TokenKind::Semi => {
                    self.pos += 1;
                    return;
                }
                TokenKind::RBrace => return,
                _ => self.pos += 1,
            }
        }
    }

    // ---- name resolution ------------------------------------------------

    fn lookup_var(&self, name: Id) -> Option<TypeSpec> {
        self.scopes.iter().rev().find_map(|s| s.get(&name).copied())
    }

    /// Every identifier reference goes through here: TDZ first, then
    /// plain resolution.  Failures are accumulated, not fatal.
    fn check_ident(&mut self, token: Token<'src>) -> Id {
        let name = id(token.text());
        if self.tdz.contains(&name) {
            self.errors.push(Diagnostic::at(
                ErrorKind::Tdz,
                token.pos(),
                format!("'{}' is used before its 'let' declaration", token.text()),
            ));
        } else if self.lookup_var(name).is_none() {
            self.errors.push(Diagnostic::at(
                ErrorKind::Name,
                token.pos(),
                format!("undefined variable '{}'", token.text()),
            ));
        }
        name
    }

    // ---- top level ------------------------------------------------------

    fn program(&mut self) -> Program {
        let mut functions = Vec::new();
        while !self.at_end() {
            let outcome = if self.at(TokenKind::Struct)
                && self.kind_at(1) == Some(TokenKind::Id)
                && self.kind_at(2) == Some(TokenKind::LBrace)
            {
                self.struct_decl().map(|()| None)
            } else if self.at(TokenKind::Int) || self.at(TokenKind::Struct) {
                self.function_decl()
            } else {
                let token = self.bump().expect("not at end");
                Err(Diagnostic::at(
                    ErrorKind::Parse,
                    token.pos(),
                    format!("expected a function or struct declaration, found '{}'", token.text()),
                ))
            };
            match outcome {
                Ok(Some(function)) => functions.push(function),
                Ok(None) => {}
                Err(diag) => {
                    self.errors.push(diag);
                    self.synchronize();
                }
            }
        }
        Program { functions }
    }

    fn struct_decl(&mut self) -> Result<(), Diagnostic> {
        let kw = self.expect(TokenKind::Struct)?;
        let name_token = self.expect(TokenKind::Id)?;
        let name = id(name_token.text());
        self.expect(TokenKind::LBrace)?;

        let mut fields: Vec<FieldDef> = Vec::new();
        let mut offset = 0;
        while !self.at(TokenKind::RBrace) && !self.at_end() {
            let field_ty = self.type_spec()?;
            let field_token = self.expect(TokenKind::Id)?;
            self.expect(TokenKind::Semi)?;
            let field_name = id(field_token.text());
            if fields.iter().any(|f| f.name == field_name) {
                self.errors.push(Diagnostic::at(
                    ErrorKind::Redeclaration,
                    field_token.pos(),
                    format!("duplicate field '{}' in struct '{}'", field_token.text(), name),
                ));
                continue;
            }
            let size = match field_ty.slot_size(&self.ctx.structs) {
                Some(size) => size,
                None => {
                    self.errors.push(Diagnostic::at(
                        ErrorKind::Type,
                        field_token.pos(),
                        format!("field '{}' has unknown struct type '{}'", field_token.text(), field_ty),
                    ));
                    1
                }
            };
            fields.push(FieldDef {
                name: field_name,
                ty: field_ty,
                offset,
                size,
            });
            offset += size;
        }
        self.expect(TokenKind::RBrace)?;
        // Struct declarations require a trailing semicolon.
        self.expect(TokenKind::Semi)?;

        if self.ctx.structs.contains_key(&name) {
            self.warnings.push(Diagnostic::at(
                ErrorKind::Redeclaration,
                kw.pos(),
                format!("struct '{name}' is redefined; the last definition wins"),
            ));
        }
        self.ctx.structs.insert(
            name,
            StructDef {
                name,
                fields,
                size: offset,
                pos: kw.pos(),
            },
        );
        Ok(())
    }

    fn function_decl(&mut self) -> Result<Option<Function>, Diagnostic> {
        let pos = self.here();
        let ret = self.type_spec()?;
        let name_token = self.expect(TokenKind::Id)?;
        let name = id(name_token.text());
        self.expect(TokenKind::LParen)?;

        let mut params = Vec::new();
        if !self.at(TokenKind::RParen) {
            loop {
                let param_ty = self.type_spec()?;
                let param_token = self.expect(TokenKind::Id)?;
                if matches!(param_ty.base, BaseType::Struct(_)) && !param_ty.is_pointer() {
                    self.errors.push(Diagnostic::at(
                        ErrorKind::Type,
                        param_token.pos(),
                        format!(
                            "parameter '{}' passes a struct by value, which is not supported; pass a pointer",
                            param_token.text()
                        ),
                    ));
                }
                params.push(Param {
                    name: id(param_token.text()),
                    ty: param_ty,
                });
                if self.eat(TokenKind::Comma).is_none() {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;

        // A bare `;` is a forward declaration: signature only, no body.
        let has_body = !self.at(TokenKind::Semi);
        let mut already_defined = false;
        if let Some(existing) = self.ctx.functions.get(&name) {
            already_defined = existing.has_body;
            if existing.builtin || (existing.has_body && has_body) {
                let what = if existing.builtin { "builtin" } else { "function" };
                self.errors.push(Diagnostic::at(
                    ErrorKind::Redeclaration,
                    name_token.pos(),
                    format!("{what} '{name}' is already declared"),
                ));
            }
        }
        self.ctx.functions.insert(
            name,
            FunctionSig {
                name,
                params: params.clone(),
                ret,
                builtin: false,
                has_body: has_body || already_defined,
            },
        );

        if self.eat(TokenKind::Semi).is_some() {
            return Ok(None);
        }

        self.tdz = self.prescan_lets();
        let mut scope = Map::new();
        for param in &params {
            scope.insert(param.name, param.ty);
        }
        self.scopes.push(scope);
        let body = self.block_statements();
        self.scopes.pop();
        self.tdz.clear();

        Ok(Some(Function {
            name,
            params,
            ret,
            body: body?,
            pos,
        }))
    }

    /// Collect every `let` name in the function body ahead of parsing it,
    /// so references can be checked against the temporal dead zone.
    fn prescan_lets(&self) -> Set<Id> {
        let mut lets = Set::new();
        let mut depth = 0usize;
        let mut i = self.pos;
        while let Some(token) = self.tokens.get(i) {
            match token.kind() {
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                TokenKind::Let => {
                    if let Some(name) = self.tokens.get(i + 1) {
                        if name.kind() == TokenKind::Id {
                            lets.insert(id(name.text()));
                        }
                    }
                }
                _ => {}
            }
            i += 1;
        }
        lets
    }

    // ---- types ----------------------------------------------------------

    fn type_spec(&mut self) -> Result<TypeSpec, Diagnostic> {
        let base = if self.eat(TokenKind::Int).is_some() {
            BaseType::Int
        } else if self.eat(TokenKind::Struct).is_some() {
            let name = self.expect(TokenKind::Id)?;
            BaseType::Struct(id(name.text()))
        } else {
            let pos = self.here();
            let found = self.cur().map(|t| t.text().to_owned());
            return Err(Diagnostic::at(
                ErrorKind::Parse,
                pos,
                format!(
                    "expected a type, found '{}'",
                    found.as_deref().unwrap_or("end of input")
                ),
            ));
        };
        // `*` adds one pointer level, `**` adds two.
        let mut pointer_level = 0u8;
        loop {
            if self.eat(TokenKind::Star).is_some() {
                pointer_level += 1;
            } else if self.eat(TokenKind::Power).is_some() {
                pointer_level += 2;
            } else {
                break;
            }
        }
        Ok(TypeSpec {
            base,
            pointer_level,
        })
    }

    // ---- statements -----------------------------------------------------

    /// `{ ... }` as a statement: opens a parse scope.
    fn block(&mut self) -> Result<Stmt, Diagnostic> {
        Ok(Stmt::Block(self.block_statements()?))
    }

    fn block_statements(&mut self) -> Result<Vec<Stmt>, Diagnostic> {
        self.expect(TokenKind::LBrace)?;
        self.scopes.push(Map::new());
        let mut stmts = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at_end() {
            match self.statement() {
                Ok(stmt) => stmts.push(stmt),
                Err(diag) => {
                    self.errors.push(diag);
                    self.synchronize();
                }
            }
        }
        self.scopes.pop();
        self.expect(TokenKind::RBrace)?;
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, Diagnostic> {
        use TokenKind::*;

        match self.kind_at(0) {
            Some(Semi) => {
                self.bump();
                Ok(Stmt::Empty)
            }
            Some(LBrace) => self.block(),
            Some(If) => self.if_stmt(),
            Some(While) => self.while_stmt(),
            Some(For) => self.for_stmt(),
            Some(Return) => {
                let kw = self.bump().expect("return token");
                let value = if self.at(Semi) {
                    None
                } else {
                    Some(self.expr()?)
                };
                self.expect(Semi)?;
                Ok(Stmt::Return {
                    value,
                    pos: kw.pos(),
                })
            }
            Some(Break) => {
                let kw = self.bump().expect("break token");
                self.expect(Semi)?;
                Ok(Stmt::Break(kw.pos()))
            }
            Some(Continue) => {
                let kw = self.bump().expect("continue token");
                self.expect(Semi)?;
                Ok(Stmt::Continue(kw.pos()))
            }
            Some(Int) | Some(Let) | Some(Struct) => self.var_decl(),
            Some(Star) | Some(Power) => {
                // `*+ IDENT =` is an assignment through pointers; anything
                // else starting with a dereference is an expression
                // statement.
                if self.deref_assignment_ahead() {
                    self.assignment(true)
                } else {
                    self.expr_stmt()
                }
            }
            Some(Id) => {
                let second = self.kind_at(1);
                let is_member_assign = matches!(second, Some(Dot) | Some(Arrow))
                    && self.kind_at(2) == Some(Id)
                    && self.kind_at(3) == Some(Assign);
                if second == Some(Assign) || is_member_assign {
                    self.assignment(true)
                } else {
                    self.expr_stmt()
                }
            }
            _ => self.expr_stmt(),
        }
    }

    /// Look past a run of `*`/`**` tokens: does an `IDENT =` follow?
    fn deref_assignment_ahead(&self) -> bool {
        let mut i = 0;
        while matches!(
            self.kind_at(i),
            Some(TokenKind::Star) | Some(TokenKind::Power)
        ) {
            i += 1;
        }
        self.kind_at(i) == Some(TokenKind::Id) && self.kind_at(i + 1) == Some(TokenKind::Assign)
    }

    fn expr_stmt(&mut self) -> Result<Stmt, Diagnostic> {
        let expr = self.expr()?;
        if self.at(TokenKind::Assign) {
            // Assignment targets are restricted to identifiers,
            // dereferences, and member accesses.
            return Err(Diagnostic::at(
                ErrorKind::Parse,
                self.here(),
                "invalid assignment target".to_owned(),
            ));
        }
        self.expect(TokenKind::Semi)?;
        Ok(Stmt::Expr(expr))
    }

    /// Parse an assignment statement.  `expect_semi` is false for the
    /// update clause of a `for`.
    fn assignment(&mut self, expect_semi: bool) -> Result<Stmt, Diagnostic> {
        use TokenKind::*;

        let pos = self.here();
        let target = if self.at(Star) || self.at(Power) {
            // Count both `*` and `**` while they keep appearing and wrap
            // the identifier in that many dereference nodes.
            let mut levels = 0usize;
            loop {
                if self.eat(Star).is_some() {
                    levels += 1;
                } else if self.eat(Power).is_some() {
                    levels += 2;
                } else {
                    break;
                }
            }
            let token = self.expect(Id)?;
            let name = self.check_ident(token);
            let mut expr = Expr::Ident(name);
            for _ in 0..levels {
                expr = Expr::Deref(Box::new(expr));
            }
            expr
        } else {
            let token = self.expect(Id)?;
            if self.eat(Dot).is_some() {
                Expr::Member(self.member_access(token, false)?)
            } else if self.eat(Arrow).is_some() {
                Expr::Member(self.member_access(token, true)?)
            } else {
                Expr::Ident(self.check_ident(token))
            }
        };
        self.expect(Assign)?;
        let value = self.expr()?;
        if expect_semi {
            self.expect(Semi)?;
        }
        Ok(Stmt::Assign { target, value, pos })
    }

    fn var_decl(&mut self) -> Result<Stmt, Diagnostic> {
        use TokenKind::*;

        let is_let = self.at(Let);
        let ty = if self.eat(Let).is_some() {
            // `let` declares integers; pointer levels still apply.
            let mut pointer_level = 0u8;
            loop {
                if self.eat(Star).is_some() {
                    pointer_level += 1;
                } else if self.eat(Power).is_some() {
                    pointer_level += 2;
                } else {
                    break;
                }
            }
            TypeSpec {
                base: BaseType::Int,
                pointer_level,
            }
        } else {
            self.type_spec()?
        };

        let name_token = self.expect(Id)?;
        let name = id(name_token.text());

        let size = match ty.slot_size(&self.ctx.structs) {
            Some(size) => size,
            None => {
                self.errors.push(Diagnostic::at(
                    ErrorKind::Type,
                    name_token.pos(),
                    format!("'{}' has unknown struct type '{}'", name_token.text(), ty),
                ));
                1
            }
        };

        if let Some(scope) = self.scopes.last() {
            if scope.contains_key(&name) {
                self.errors.push(Diagnostic::at(
                    ErrorKind::Redeclaration,
                    name_token.pos(),
                    format!("'{}' is already declared in this scope", name_token.text()),
                ));
            }
        }

        let is_struct_value = matches!(ty.base, BaseType::Struct(_)) && !ty.is_pointer();
        let mut init = None;
        if self.eat(Assign).is_some() {
            let value = self.expr()?;
            if is_struct_value {
                self.errors.push(Diagnostic::at(
                    ErrorKind::Type,
                    name_token.pos(),
                    format!(
                        "struct value '{}' cannot take an initializer",
                        name_token.text()
                    ),
                ));
            } else {
                init = Some(value);
            }
        }
        self.expect(Semi)?;

        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name, ty);
        }
        if is_let {
            self.tdz.remove(&name);
        }

        let decl = Decl {
            name,
            ty,
            size,
            init,
            pos: name_token.pos(),
        };
        Ok(if is_let {
            Stmt::LetDecl(decl)
        } else {
            Stmt::VarDecl(decl)
        })
    }

    fn if_stmt(&mut self) -> Result<Stmt, Diagnostic> {
        self.expect(TokenKind::If)?;
        self.expect(TokenKind::LParen)?;
        let cond = self.expr()?;
        self.expect(TokenKind::RParen)?;
        let then_branch = Box::new(self.statement()?);
        let else_branch = if self.eat(TokenKind::Else).is_some() {
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    fn while_stmt(&mut self) -> Result<Stmt, Diagnostic> {
        self.expect(TokenKind::While)?;
        self.expect(TokenKind::LParen)?;
        let cond = self.expr()?;
        self.expect(TokenKind::RParen)?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::While { cond, body })
    }

    fn for_stmt(&mut self) -> Result<Stmt, Diagnostic> {
        use TokenKind::*;

        self.expect(For)?;
        self.expect(LParen)?;

        let init = if self.eat(Semi).is_some() {
            None
        } else if self.at(Int) || self.at(Let) || self.at(Struct) {
            Some(Box::new(self.var_decl()?))
        } else if self.assignment_ahead() {
            Some(Box::new(self.assignment(true)?))
        } else {
            let expr = self.expr()?;
            self.expect(Semi)?;
            Some(Box::new(Stmt::Expr(expr)))
        };

        let cond = if self.at(Semi) {
            None
        } else {
            Some(self.expr()?)
        };
        self.expect(Semi)?;

        let update = if self.at(RParen) {
            None
        } else if self.assignment_ahead() {
            Some(Box::new(self.assignment(false)?))
        } else {
            Some(Box::new(Stmt::Expr(self.expr()?)))
        };
        self.expect(RParen)?;

        let body = Box::new(self.statement()?);
        Ok(Stmt::For {
            init,
            cond,
            update,
            body,
        })
    }

    /// Does an assignment statement start here?
    fn assignment_ahead(&self) -> bool {
        use TokenKind::*;
        if self.at(Star) || self.at(Power) {
            return self.deref_assignment_ahead();
        }
        if !self.at(Id) {
            return false;
        }
        match self.kind_at(1) {
            Some(Assign) => true,
            Some(Dot) | Some(Arrow) => {
                self.kind_at(2) == Some(Id) && self.kind_at(3) == Some(Assign)
            }
            _ => false,
        }
    }

    // ---- expressions ----------------------------------------------------

    fn expr(&mut self) -> Result<Expr, Diagnostic> {
        self.logical_or()
    }

    fn logical_or(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.logical_and()?;
        while self.eat(TokenKind::OrOr).is_some() {
            let rhs = self.logical_and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn logical_and(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.equality()?;
        while self.eat(TokenKind::AndAnd).is_some() {
            let rhs = self.equality()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.relational()?;
        loop {
            let op = if self.eat(TokenKind::EqEq).is_some() {
                BinOp::Eq
            } else if self.eat(TokenKind::Ne).is_some() {
                BinOp::Ne
            } else {
                return Ok(lhs);
            };
            let rhs = self.relational()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn relational(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.additive()?;
        loop {
            let op = if self.eat(TokenKind::Lt).is_some() {
                BinOp::Lt
            } else if self.eat(TokenKind::Le).is_some() {
                BinOp::Le
            } else if self.eat(TokenKind::Gt).is_some() {
                BinOp::Gt
            } else if self.eat(TokenKind::Ge).is_some() {
                BinOp::Ge
            } else {
                return Ok(lhs);
            };
            let rhs = self.additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn additive(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = if self.eat(TokenKind::Plus).is_some() {
                BinOp::Add
            } else if self.eat(TokenKind::Minus).is_some() {
                BinOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.power()?;
        loop {
            let op = if self.eat(TokenKind::Star).is_some() {
                BinOp::Mul
            } else if self.eat(TokenKind::Slash).is_some() {
                BinOp::Div
            } else if self.eat(TokenKind::Percent).is_some() {
                BinOp::Mod
            } else {
                return Ok(lhs);
            };
            let rhs = self.power()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn power(&mut self) -> Result<Expr, Diagnostic> {
        let lhs = self.unary()?;
        // `**` between two expressions is exponentiation, right
        // associative.  Leading `**` is handled in `unary` as a double
        // dereference.
        if self.eat(TokenKind::Power).is_some() {
            let rhs = self.power()?;
            return Ok(Expr::Binary {
                op: BinOp::Power,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, Diagnostic> {
        use TokenKind::*;

        if self.eat(Minus).is_some() {
            return Ok(Expr::Unary {
                op: UnOp::Neg,
                inner: Box::new(self.unary()?),
            });
        }
        if self.eat(Bang).is_some() {
            return Ok(Expr::Unary {
                op: UnOp::Not,
                inner: Box::new(self.unary()?),
            });
        }
        if self.eat(Star).is_some() {
            return Ok(Expr::Deref(Box::new(self.unary()?)));
        }
        if self.eat(Power).is_some() {
            return Ok(Expr::Deref(Box::new(Expr::Deref(Box::new(self.unary()?)))));
        }
        if self.eat(Amp).is_some() {
            let token = self.expect(Id)?;
            let name = self.check_ident(token);
            return Ok(Expr::AddressOf(name));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, Diagnostic> {
        use TokenKind::*;

        match self.kind_at(0) {
            Some(Num) => {
                let token = self.bump().expect("number token");
                let value = token.text().parse::<i64>().map_err(|_| {
                    Diagnostic::at(
                        ErrorKind::Parse,
                        token.pos(),
                        format!("integer literal '{}' is out of range", token.text()),
                    )
                })?;
                Ok(Expr::Number(value))
            }
            Some(LParen) => {
                self.bump();
                let inner = self.expr()?;
                self.expect(RParen)?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            Some(Id) => {
                let token = self.bump().expect("identifier token");
                if self.at(LParen) {
                    return self.call(token);
                }
                if self.eat(Dot).is_some() {
                    return Ok(Expr::Member(self.member_access(token, false)?));
                }
                if self.eat(Arrow).is_some() {
                    return Ok(Expr::Member(self.member_access(token, true)?));
                }
                Ok(Expr::Ident(self.check_ident(token)))
            }
            _ => {
                let pos = self.here();
                let found = self.cur().map(|t| t.text().to_owned());
                Err(Diagnostic::at(
                    ErrorKind::Parse,
                    pos,
                    format!(
                        "expected an expression, found '{}'",
                        found.as_deref().unwrap_or("end of input")
                    ),
                ))
            }
        }
    }

    fn call(&mut self, callee_token: Token<'src>) -> Result<Expr, Diagnostic> {
        let callee = id(callee_token.text());
        if !self.ctx.functions.contains_key(&callee) {
            self.errors.push(Diagnostic::at(
                ErrorKind::Name,
                callee_token.pos(),
                format!("undefined function '{}'", callee_token.text()),
            ));
        }
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.at(TokenKind::RParen) {
            loop {
                args.push(self.expr()?);
                if self.eat(TokenKind::Comma).is_none() {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(Expr::Call {
            callee,
            args,
            pos: callee_token.pos(),
        })
    }

    /// Resolve `obj.field` / `obj->field` against the struct table.
    fn member_access(
        &mut self,
        object_token: Token<'src>,
        via_pointer: bool,
    ) -> Result<MemberAccess, Diagnostic> {
        let field_token = self.expect(TokenKind::Id)?;
        let object = id(object_token.text());
        let field = id(field_token.text());

        let ty = self.lookup_var(object).ok_or_else(|| {
            Diagnostic::at(
                ErrorKind::Name,
                object_token.pos(),
                format!("undefined variable '{}'", object_token.text()),
            )
        })?;

        let struct_name = match (ty.base, ty.pointer_level, via_pointer) {
            (BaseType::Struct(name), 0, false) | (BaseType::Struct(name), 1, true) => name,
            (BaseType::Struct(_), _, false) => {
                return Err(Diagnostic::at(
                    ErrorKind::Type,
                    object_token.pos(),
                    format!("'.' needs a struct value, but '{}' is '{}'", object_token.text(), ty),
                ))
            }
            (BaseType::Struct(_), _, true) => {
                return Err(Diagnostic::at(
                    ErrorKind::Type,
                    object_token.pos(),
                    format!(
                        "'->' needs a struct pointer, but '{}' is '{}'",
                        object_token.text(),
                        ty
                    ),
                ))
            }
            (BaseType::Int, ..) => {
                return Err(Diagnostic::at(
                    ErrorKind::Type,
                    object_token.pos(),
                    format!("'{}' is not a struct", object_token.text()),
                ))
            }
        };

        let def = self.ctx.structs.get(&struct_name).ok_or_else(|| {
            Diagnostic::at(
                ErrorKind::Type,
                object_token.pos(),
                format!("unknown struct '{struct_name}'"),
            )
        })?;
        let field_def = def.field(field).ok_or_else(|| {
            Diagnostic::at(
                ErrorKind::Type,
                field_token.pos(),
                format!("struct '{struct_name}' has no field '{}'", field_token.text()),
            )
        })?;

        Ok(MemberAccess {
            object,
            field,
            field_offset: field_def.offset,
            struct_name,
            via_pointer,
            struct_size: def.size,
            pos: object_token.pos(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> (Program, CompilerContext) {
        let mut ctx = CompilerContext::new();
        let result = parse(src, &mut ctx);
        assert!(
            result.errors.is_empty(),
            "unexpected errors: {:?}",
            result.errors
        );
        (result.program, ctx)
    }

    fn parse_errors(src: &str) -> Vec<Diagnostic> {
        let mut ctx = CompilerContext::new();
        parse(src, &mut ctx).errors
    }

    #[test]
    fn simple_function() {
        let (program, _) = parse_ok("int main() { return 7; }");
        assert_eq!(program.functions.len(), 1);
        assert_eq!(program.functions[0].name.as_str(), "main");
        assert_eq!(program.functions[0].body.len(), 1);
    }

    #[test]
    fn precedence_puts_mul_under_add() {
        let (program, _) = parse_ok("int main() { return 1 + 2 * 3; }");
        let Stmt::Return {
            value: Some(Expr::Binary { op, rhs, .. }),
            ..
        } = &program.functions[0].body[0]
        else {
            panic!("expected a return of a binary expression");
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(**rhs, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn power_is_right_associative() {
        let (program, _) = parse_ok("int main() { return 2 ** 3 ** 2; }");
        let Stmt::Return {
            value: Some(Expr::Binary { op, rhs, .. }),
            ..
        } = &program.functions[0].body[0]
        else {
            panic!("expected a return");
        };
        assert_eq!(*op, BinOp::Power);
        assert!(matches!(**rhs, Expr::Binary { op: BinOp::Power, .. }));
    }

    #[test]
    fn double_star_in_unary_position_is_double_deref() {
        let (program, _) = parse_ok("int main(int** q) { return **q; }");
        let Stmt::Return {
            value: Some(Expr::Deref(inner)),
            ..
        } = &program.functions[0].body[0]
        else {
            panic!("expected a deref");
        };
        assert!(matches!(**inner, Expr::Deref(_)));
    }

    #[test]
    fn deref_assignment_target() {
        let (program, _) = parse_ok("int main() { int p = alloc(1); *p = 5; return 0; }");
        let Stmt::Assign { target, .. } = &program.functions[0].body[1] else {
            panic!("expected an assignment");
        };
        assert!(matches!(target, Expr::Deref(_)));
    }

    #[test]
    fn invalid_assignment_target_is_rejected() {
        let errors = parse_errors("int main() { (1) = 2; return 0; }");
        assert!(errors
            .iter()
            .any(|e| e.kind == ErrorKind::Parse && e.message.contains("assignment target")));
    }

    #[test]
    fn struct_fields_get_slot_offsets() {
        let (_, ctx) = parse_ok(
            "struct Point { int x; int y; };\n\
             struct Rect { struct Point a; struct Point b; int tag; };\n\
             int main() { return 0; }",
        );
        let rect = ctx.structs.get(&id("Rect")).unwrap();
        assert_eq!(rect.size, 5);
        assert_eq!(rect.field(id("b")).unwrap().offset, 2);
        assert_eq!(rect.field(id("tag")).unwrap().offset, 4);
    }

    #[test]
    fn pointer_fields_are_one_slot() {
        let (_, ctx) = parse_ok(
            "struct Node { int value; struct Node* next; };\n\
             int main() { return 0; }",
        );
        assert_eq!(ctx.structs.get(&id("Node")).unwrap().size, 2);
    }

    #[test]
    fn member_access_resolves_offsets() {
        let (program, _) = parse_ok(
            "struct Point { int x; int y; };\n\
             int main() { struct Point p; p.y = 3; return p.y; }",
        );
        let Stmt::Assign {
            target: Expr::Member(access),
            ..
        } = &program.functions[0].body[1]
        else {
            panic!("expected a member assignment");
        };
        assert_eq!(access.field_offset, 1);
        assert!(!access.via_pointer);
        assert_eq!(access.struct_size, 2);
    }

    #[test]
    fn struct_value_initializer_is_a_type_error() {
        let errors = parse_errors(
            "struct Point { int x; int y; };\n\
             int main() { struct Point p = 0; return 0; }",
        );
        assert!(errors.iter().any(|e| e.kind == ErrorKind::Type));
    }

    #[test]
    fn struct_value_parameter_is_a_type_error() {
        let errors = parse_errors(
            "struct Point { int x; int y; };\n\
             int f(struct Point p) { return 0; }\n\
             int main() { return 0; }",
        );
        assert!(errors.iter().any(|e| e.kind == ErrorKind::Type));
    }

    #[test]
    fn tdz_use_before_let_is_reported() {
        let errors = parse_errors("int main() { int y = x + 1; let x = 2; return y; }");
        assert!(errors.iter().any(|e| e.kind == ErrorKind::Tdz));
    }

    #[test]
    fn for_loop_variable_is_not_in_tdz() {
        let (_, _) = parse_ok("int main() { int s = 0; for (let i = 0; i < 3; i = i + 1) s = s + i; return s; }");
    }

    #[test]
    fn undefined_variable_is_a_name_error() {
        let errors = parse_errors("int main() { return nope; }");
        assert!(errors.iter().any(|e| e.kind == ErrorKind::Name));
    }

    #[test]
    fn undefined_function_is_a_name_error() {
        let errors = parse_errors("int main() { return nope(); }");
        assert!(errors.iter().any(|e| e.kind == ErrorKind::Name));
    }

    #[test]
    fn builtins_are_preregistered() {
        let (_, _) = parse_ok("int main() { int p = alloc(3); free(p); return 0; }");
    }

    #[test]
    fn forward_declaration_then_definition() {
        let (program, _) = parse_ok(
            "int helper(int n);\n\
             int main() { return helper(1); }\n\
             int helper(int n) { return n; }",
        );
        // the prototype contributes no body
        assert_eq!(program.functions.len(), 2);
    }

    #[test]
    fn duplicate_function_definition_is_reported() {
        let errors = parse_errors("int f() { return 1; }\nint f() { return 2; }\nint main() { return 0; }");
        assert!(errors.iter().any(|e| e.kind == ErrorKind::Redeclaration));
    }

    #[test]
    fn redefining_a_builtin_is_reported() {
        let errors = parse_errors("int alloc(int n) { return 0; }\nint main() { return 0; }");
        assert!(errors.iter().any(|e| e.kind == ErrorKind::Redeclaration));
    }

    #[test]
    fn redeclaration_in_same_scope() {
        let errors = parse_errors("int main() { int x = 1; int x = 2; return x; }");
        assert!(errors.iter().any(|e| e.kind == ErrorKind::Redeclaration));
    }

    #[test]
    fn shadowing_in_inner_scope_is_fine() {
        let (_, _) = parse_ok("int main() { int x = 1; { int x = 2; } return x; }");
    }

    #[test]
    fn struct_redefinition_is_a_warning() {
        let mut ctx = CompilerContext::new();
        let result = parse(
            "struct P { int x; };\nstruct P { int x; int y; };\nint main() { return 0; }",
            &mut ctx,
        );
        assert!(result.errors.is_empty());
        assert_eq!(result.warnings.len(), 1);
        // last definition wins
        assert_eq!(ctx.structs.get(&id("P")).unwrap().size, 2);
    }

    #[test]
    fn parser_recovers_and_keeps_going() {
        let errors = parse_errors("int main() { int x = ; return 0; }");
        assert!(!errors.is_empty());
    }
}
