//! Recursive-descent parser over the token stream from [`crate::lexer`].
//!
//! One statement per call, one table per statement: no joins, no
//! subqueries, no ORDER BY/LIMIT. WHERE and HAVING each hold at most two
//! predicates joined by a single AND/OR.

use crate::error::{DbError, Result};
use crate::lexer::{Lexer, Token};
use crate::types::DataType;

pub mod ast;
pub use ast::*;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn parse(sql: &str) -> Result<Statement> {
        let tokens = Lexer::new(sql).tokenize()?;
        let mut parser = Parser { tokens, pos: 0 };
        let stmt = parser.parse_statement()?;
        if *parser.peek() == Token::Semicolon {
            parser.advance();
        }
        Ok(stmt)
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let t = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(DbError::Syntax(format!(
                "expected {:?}, found {:?}",
                expected,
                self.peek()
            )))
        }
    }

    fn consume_identifier(&mut self) -> Result<String> {
        match self.advance() {
            Token::Identifier(s) => Ok(s),
            other => Err(DbError::Syntax(format!("expected identifier, found {:?}", other))),
        }
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        match self.peek().clone() {
            Token::Select => self.parse_select(),
            Token::Insert => self.parse_insert(),
            Token::Update => self.parse_update(),
            Token::Delete => self.parse_delete(),
            Token::Create => self.parse_create(),
            Token::Drop => self.parse_drop(),
            Token::Begin => self.parse_begin(),
            Token::Commit => {
                self.advance();
                Ok(Statement::Commit)
            }
            Token::Abort | Token::Rollback => {
                self.advance();
                Ok(Statement::Abort)
            }
            Token::Use => {
                self.advance();
                self.expect(Token::Database)?;
                Ok(Statement::UseDatabase(self.consume_identifier()?))
            }
            Token::Show => self.parse_show(),
            Token::Describe => {
                self.advance();
                Ok(Statement::Describe(self.consume_identifier()?))
            }
            other => Err(DbError::Syntax(format!("unexpected token: {:?}", other))),
        }
    }

    fn parse_begin(&mut self) -> Result<Statement> {
        self.advance();
        let isolation = if let Token::Identifier(_) = self.peek() {
            // BEGIN READ COMMITTED / BEGIN REPEATABLE READ: identifiers are
            // re-lexed as plain identifiers, so stitch consecutive words.
            let mut words = vec![self.consume_identifier()?];
            if let Token::Identifier(_) = self.peek() {
                words.push(self.consume_identifier()?);
            }
            Some(words.join(" "))
        } else {
            None
        };
        Ok(Statement::Begin { isolation })
    }

    fn parse_show(&mut self) -> Result<Statement> {
        self.advance();
        match self.advance() {
            Token::Tables => Ok(Statement::ShowTables),
            Token::Databases => Ok(Statement::ShowDatabases),
            other => Err(DbError::Syntax(format!(
                "expected TABLES or DATABASES, found {:?}",
                other
            ))),
        }
    }

    fn parse_create(&mut self) -> Result<Statement> {
        self.advance();
        match self.advance() {
            Token::Database => Ok(Statement::CreateDatabase(self.consume_identifier()?)),
            Token::Table => self.parse_create_table(),
            other => Err(DbError::Syntax(format!(
                "expected DATABASE or TABLE, found {:?}",
                other
            ))),
        }
    }

    fn parse_create_table(&mut self) -> Result<Statement> {
        let name = self.consume_identifier()?;
        self.expect(Token::LeftParen)?;
        let mut fields = Vec::new();
        loop {
            let field_name = self.consume_identifier()?;
            let ty = match self.advance() {
                Token::Int32 => DataType::Int32,
                Token::Int64 => DataType::Int64,
                Token::StringType => DataType::String,
                other => {
                    return Err(DbError::Syntax(format!(
                        "expected a type for field {}, found {:?}",
                        field_name, other
                    )))
                }
            };
            let mut primary = false;
            let mut unique = false;
            loop {
                match self.peek() {
                    Token::Primary => {
                        self.advance();
                        self.expect(Token::Key)?;
                        primary = true;
                    }
                    Token::Unique => {
                        self.advance();
                        unique = true;
                    }
                    _ => break,
                }
            }
            fields.push(FieldDef {
                name: field_name,
                ty,
                primary,
                unique,
            });
            match self.advance() {
                Token::Comma => continue,
                Token::RightParen => break,
                other => {
                    return Err(DbError::Syntax(format!(
                        "expected , or ) in column list, found {:?}",
                        other
                    )))
                }
            }
        }
        Ok(Statement::CreateTable { name, fields })
    }

    fn parse_drop(&mut self) -> Result<Statement> {
        self.advance();
        match self.advance() {
            Token::Database => Ok(Statement::DropDatabase(self.consume_identifier()?)),
            Token::Table => Ok(Statement::DropTable(self.consume_identifier()?)),
            other => Err(DbError::Syntax(format!(
                "expected DATABASE or TABLE, found {:?}",
                other
            ))),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal> {
        match self.advance() {
            Token::NumberLiteral(s) => s
                .parse::<i64>()
                .map(Literal::Int)
                .map_err(|_| DbError::Syntax(format!("invalid integer literal: {}", s))),
            Token::StringLiteral(s) => Ok(Literal::Str(s)),
            other => Err(DbError::Syntax(format!("expected a literal, found {:?}", other))),
        }
    }

    fn parse_compare_op(&mut self) -> Result<CompareOp> {
        match self.advance() {
            Token::Equal => Ok(CompareOp::Eq),
            Token::NotEqual => Ok(CompareOp::Ne),
            Token::LessThan => Ok(CompareOp::Lt),
            Token::LessThanEq => Ok(CompareOp::Le),
            Token::GreaterThan => Ok(CompareOp::Gt),
            Token::GreaterThanEq => Ok(CompareOp::Ge),
            other => Err(DbError::Syntax(format!(
                "expected a comparison operator, found {:?}",
                other
            ))),
        }
    }

    fn parse_predicate(&mut self) -> Result<Predicate> {
        let field = self.consume_identifier()?;
        let op = self.parse_compare_op()?;
        let value = self.parse_literal()?;
        Ok(Predicate { field, op, value })
    }

    fn parse_where_clause(&mut self) -> Result<Option<WhereClause>> {
        if *self.peek() != Token::Where {
            return Ok(None);
        }
        self.advance();
        let first = self.parse_predicate()?;
        let rest = match self.peek() {
            Token::And => {
                self.advance();
                Some((LogicalOp::And, self.parse_predicate()?))
            }
            Token::Or => {
                self.advance();
                Some((LogicalOp::Or, self.parse_predicate()?))
            }
            _ => None,
        };
        Ok(Some(WhereClause { first, rest }))
    }

    fn parse_insert(&mut self) -> Result<Statement> {
        self.advance();
        self.expect(Token::Into)?;
        let table = self.consume_identifier()?;
        let columns = if *self.peek() == Token::LeftParen {
            self.advance();
            let mut cols = Vec::new();
            loop {
                cols.push(self.consume_identifier()?);
                match self.advance() {
                    Token::Comma => continue,
                    Token::RightParen => break,
                    other => {
                        return Err(DbError::Syntax(format!(
                            "expected , or ) in column list, found {:?}",
                            other
                        )))
                    }
                }
            }
            Some(cols)
        } else {
            None
        };
        self.expect(Token::Values)?;
        self.expect(Token::LeftParen)?;
        let mut values = Vec::new();
        loop {
            values.push(self.parse_literal()?);
            match self.advance() {
                Token::Comma => continue,
                Token::RightParen => break,
                other => {
                    return Err(DbError::Syntax(format!(
                        "expected , or ) in value list, found {:?}",
                        other
                    )))
                }
            }
        }
        Ok(Statement::Insert {
            table,
            columns,
            values,
        })
    }

    fn parse_update(&mut self) -> Result<Statement> {
        self.advance();
        let table = self.consume_identifier()?;
        self.expect(Token::Set)?;
        let mut assignments = Vec::new();
        loop {
            let col = self.consume_identifier()?;
            self.expect(Token::Equal)?;
            let value = self.parse_literal()?;
            assignments.push((col, value));
            if *self.peek() == Token::Comma {
                self.advance();
                continue;
            }
            break;
        }
        let where_clause = self.parse_where_clause()?;
        Ok(Statement::Update {
            table,
            assignments,
            where_clause,
        })
    }

    fn parse_delete(&mut self) -> Result<Statement> {
        self.advance();
        self.expect(Token::From)?;
        let table = self.consume_identifier()?;
        let where_clause = self.parse_where_clause()?;
        Ok(Statement::Delete {
            table,
            where_clause,
        })
    }

    fn parse_select_item(&mut self) -> Result<SelectItem> {
        if *self.peek() == Token::Star {
            self.advance();
            return Ok(SelectItem::Star);
        }
        let name = self.consume_identifier()?;
        if let Some(agg) = AggFunc::from_name(&name) {
            if *self.peek() == Token::LeftParen {
                self.advance();
                let column = if *self.peek() == Token::Star {
                    self.advance();
                    None
                } else {
                    Some(self.consume_identifier()?)
                };
                self.expect(Token::RightParen)?;
                return Ok(SelectItem::Aggregate(agg, column));
            }
        }
        Ok(SelectItem::Column(name))
    }

    fn parse_select(&mut self) -> Result<Statement> {
        self.advance();
        let mut items = vec![self.parse_select_item()?];
        while *self.peek() == Token::Comma {
            self.advance();
            items.push(self.parse_select_item()?);
        }
        self.expect(Token::From)?;
        let table = self.consume_identifier()?;
        let where_clause = self.parse_where_clause()?;

        let group_by = if *self.peek() == Token::Group {
            self.advance();
            self.expect(Token::By)?;
            Some(self.consume_identifier()?)
        } else {
            None
        };

        let having = if *self.peek() == Token::Having {
            self.advance();
            let name = self.consume_identifier()?;
            let agg = AggFunc::from_name(&name)
                .ok_or_else(|| DbError::Syntax(format!("HAVING requires an aggregate, found {}", name)))?;
            self.expect(Token::LeftParen)?;
            let column = if *self.peek() == Token::Star {
                self.advance();
                None
            } else {
                Some(self.consume_identifier()?)
            };
            self.expect(Token::RightParen)?;
            let op = self.parse_compare_op()?;
            let value = self.parse_literal()?;
            Some(HavingPredicate {
                agg,
                column,
                op,
                value,
            })
        } else {
            None
        };

        Ok(Statement::Select(SelectStatement {
            table,
            items,
            where_clause,
            group_by,
            having,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_table_with_primary_key() {
        let stmt = Parser::parse("CREATE TABLE users (id INT64 PRIMARY KEY, name STRING)").unwrap();
        match stmt {
            Statement::CreateTable { name, fields } => {
                assert_eq!(name, "users");
                assert_eq!(fields.len(), 2);
                assert!(fields[0].primary);
                assert_eq!(fields[0].ty, DataType::Int64);
            }
            _ => panic!("expected CreateTable"),
        }
    }

    #[test]
    fn parses_insert_with_explicit_columns() {
        let stmt = Parser::parse("INSERT INTO users (id, name) VALUES (1, 'Alice')").unwrap();
        match stmt {
            Statement::Insert {
                table,
                columns,
                values,
            } => {
                assert_eq!(table, "users");
                assert_eq!(columns, Some(vec!["id".into(), "name".into()]));
                assert_eq!(values, vec![Literal::Int(1), Literal::Str("Alice".into())]);
            }
            _ => panic!("expected Insert"),
        }
    }

    #[test]
    fn parses_select_with_two_predicate_where() {
        let stmt = Parser::parse("SELECT id, name FROM users WHERE id > 1 AND id < 10").unwrap();
        match stmt {
            Statement::Select(select) => {
                assert_eq!(select.table, "users");
                let wc = select.where_clause.unwrap();
                assert_eq!(wc.first.op, CompareOp::Gt);
                let (op, pred) = wc.rest.unwrap();
                assert_eq!(op, LogicalOp::And);
                assert_eq!(pred.op, CompareOp::Lt);
            }
            _ => panic!("expected Select"),
        }
    }

    #[test]
    fn parses_group_by_having_aggregate() {
        let stmt = Parser::parse(
            "SELECT category, COUNT(*) FROM sales GROUP BY category HAVING COUNT(*) > 2",
        )
        .unwrap();
        match stmt {
            Statement::Select(select) => {
                assert_eq!(select.group_by, Some("category".into()));
                let having = select.having.unwrap();
                assert_eq!(having.agg, AggFunc::Count);
                assert_eq!(having.op, CompareOp::Gt);
            }
            _ => panic!("expected Select"),
        }
    }

    #[test]
    fn parses_begin_with_isolation_level() {
        let stmt = Parser::parse("BEGIN REPEATABLE READ").unwrap();
        assert_eq!(
            stmt,
            Statement::Begin {
                isolation: Some("REPEATABLE READ".into())
            }
        );
    }
}
