//! Witness policy expressions
//!
//! A witness policy is a boolean expression over proof-count
//! quantifiers, evaluated against the set of witnesses that have
//! countersigned a pending anchor:
//!
//! ```text
//! policy = expr ;
//! expr   = term {("AND"|"OR") term} ;
//! term   = "MinPercent" "(" int "," role ")"
//!        | "OutOf"      "(" int "," role ")"
//!        | "(" expr ")" ;
//! role   = "system" | "batch" ;
//! ```
//!
//! Evaluation is monotone: adding proofs never invalidates a satisfied
//! policy.

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Which witness population a quantifier counts against
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WitnessRole {
    /// Statically configured witnesses
    System,
    /// Witnesses embedded in this specific anchor's target list
    Batch,
}

impl fmt::Display for WitnessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WitnessRole::System => f.write_str("system"),
            WitnessRole::Batch => f.write_str("batch"),
        }
    }
}

/// Parsed witness policy expression
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyExpr {
    MinPercent(u32, WitnessRole),
    OutOf(u32, WitnessRole),
    And(Box<PolicyExpr>, Box<PolicyExpr>),
    Or(Box<PolicyExpr>, Box<PolicyExpr>),
}

/// Witness sets and collected proofs for one pending anchor
#[derive(Clone, Debug, Default)]
pub struct ProofContext {
    /// Statically configured witness IRIs
    pub system: BTreeSet<String>,
    /// Witness IRIs targeted by this batch
    pub batch: BTreeSet<String>,
    /// Witness IRIs that have supplied a proof
    pub proofs: BTreeSet<String>,
}

impl ProofContext {
    fn role_set(&self, role: WitnessRole) -> &BTreeSet<String> {
        match role {
            WitnessRole::System => &self.system,
            WitnessRole::Batch => &self.batch,
        }
    }

    fn proof_count(&self, role: WitnessRole) -> usize {
        self.role_set(role)
            .iter()
            .filter(|w| self.proofs.contains(*w))
            .count()
    }
}

impl PolicyExpr {
    /// Evaluate against the collected proofs. Monotone in `ctx.proofs`.
    pub fn satisfied(&self, ctx: &ProofContext) -> bool {
        match self {
            PolicyExpr::MinPercent(percent, role) => {
                let total = ctx.role_set(*role).len();
                // count >= ceil(percent * total / 100), in integers
                ctx.proof_count(*role) as u64 * 100 >= u64::from(*percent) * total as u64
            }
            PolicyExpr::OutOf(count, role) => ctx.proof_count(*role) as u64 >= u64::from(*count),
            PolicyExpr::And(a, b) => a.satisfied(ctx) && b.satisfied(ctx),
            PolicyExpr::Or(a, b) => a.satisfied(ctx) || b.satisfied(ctx),
        }
    }
}

impl fmt::Display for PolicyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyExpr::MinPercent(p, role) => write!(f, "MinPercent({p},{role})"),
            PolicyExpr::OutOf(n, role) => write!(f, "OutOf({n},{role})"),
            PolicyExpr::And(a, b) => write!(f, "{a} AND {b}"),
            PolicyExpr::Or(a, b) => write!(f, "{a} OR {b}"),
        }
    }
}

impl FromStr for PolicyExpr {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            let (offset, tok) = &parser.tokens[parser.pos];
            return Err(Error::PolicyParse {
                pos: *offset,
                message: format!("unexpected trailing token {tok:?}"),
            });
        }
        Ok(expr)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    MinPercent,
    OutOf,
    And,
    Or,
    Role(WitnessRole),
    Int(u32),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            ',' => {
                tokens.push((i, Token::Comma));
                i += 1;
            }
            '0'..='9' => {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let value: u32 = input[start..i].parse().map_err(|_| Error::PolicyParse {
                    pos: start,
                    message: format!("integer out of range: {}", &input[start..i]),
                })?;
                tokens.push((start, Token::Int(value)));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < bytes.len() && (bytes[i] as char).is_ascii_alphanumeric() {
                    i += 1;
                }
                let word = &input[start..i];
                let token = match word {
                    "MinPercent" => Token::MinPercent,
                    "OutOf" => Token::OutOf,
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "system" => Token::Role(WitnessRole::System),
                    "batch" => Token::Role(WitnessRole::Batch),
                    _ => {
                        return Err(Error::PolicyParse {
                            pos: start,
                            message: format!("unknown keyword {word:?}"),
                        })
                    }
                };
                tokens.push((start, token));
            }
            _ => {
                return Err(Error::PolicyParse {
                    pos: i,
                    message: format!("unexpected character {c:?}"),
                })
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self, expected: &str) -> Result<(usize, Token)> {
        let item = self.tokens.get(self.pos).cloned().ok_or_else(|| {
            Error::PolicyParse {
                pos: self.tokens.last().map(|(p, _)| *p + 1).unwrap_or(0),
                message: format!("expected {expected}, found end of input"),
            }
        })?;
        self.pos += 1;
        Ok(item)
    }

    fn expect(&mut self, token: Token, expected: &str) -> Result<()> {
        let (pos, found) = self.next(expected)?;
        if found != token {
            return Err(Error::PolicyParse {
                pos,
                message: format!("expected {expected}, found {found:?}"),
            });
        }
        Ok(())
    }

    // expr = term {("AND"|"OR") term}, left-associative, equal precedence
    fn expr(&mut self) -> Result<PolicyExpr> {
        let mut left = self.term()?;
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.pos += 1;
                    let right = self.term()?;
                    left = PolicyExpr::And(Box::new(left), Box::new(right));
                }
                Some(Token::Or) => {
                    self.pos += 1;
                    let right = self.term()?;
                    left = PolicyExpr::Or(Box::new(left), Box::new(right));
                }
                _ => return Ok(left),
            }
        }
    }

    fn term(&mut self) -> Result<PolicyExpr> {
        let (pos, token) = self.next("MinPercent, OutOf, or '('")?;
        match token {
            Token::MinPercent => {
                let (value, role) = self.quantifier_args()?;
                if value > 100 {
                    return Err(Error::PolicyParse {
                        pos,
                        message: format!("percentage out of range: {value}"),
                    });
                }
                Ok(PolicyExpr::MinPercent(value, role))
            }
            Token::OutOf => {
                let (value, role) = self.quantifier_args()?;
                Ok(PolicyExpr::OutOf(value, role))
            }
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            other => Err(Error::PolicyParse {
                pos,
                message: format!("expected MinPercent, OutOf, or '(', found {other:?}"),
            }),
        }
    }

    fn quantifier_args(&mut self) -> Result<(u32, WitnessRole)> {
        self.expect(Token::LParen, "'('")?;
        let (pos, value_token) = self.next("integer")?;
        let value = match value_token {
            Token::Int(v) => v,
            other => {
                return Err(Error::PolicyParse {
                    pos,
                    message: format!("expected integer, found {other:?}"),
                })
            }
        };
        self.expect(Token::Comma, "','")?;
        let (pos, role_token) = self.next("role")?;
        let role = match role_token {
            Token::Role(r) => r,
            other => {
                return Err(Error::PolicyParse {
                    pos,
                    message: format!("expected 'system' or 'batch', found {other:?}"),
                })
            }
        };
        self.expect(Token::RParen, "')'")?;
        Ok((value, role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(system: &[&str], batch: &[&str], proofs: &[&str]) -> ProofContext {
        ProofContext {
            system: system.iter().map(|s| s.to_string()).collect(),
            batch: batch.iter().map(|s| s.to_string()).collect(),
            proofs: proofs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_parse_display_roundtrip() {
        let policy: PolicyExpr = "MinPercent(100,batch) AND OutOf(1,system)".parse().unwrap();
        assert_eq!(policy.to_string(), "MinPercent(100,batch) AND OutOf(1,system)");

        let reparsed: PolicyExpr = policy.to_string().parse().unwrap();
        assert_eq!(reparsed, policy);
    }

    #[test]
    fn test_parse_parenthesized() {
        let policy: PolicyExpr = "(OutOf(1,batch) OR OutOf(2,system)) AND MinPercent(50,batch)"
            .parse()
            .unwrap();
        assert!(matches!(policy, PolicyExpr::And(_, _)));
    }

    #[test]
    fn test_parse_errors() {
        assert!("MinPercent(100)".parse::<PolicyExpr>().is_err());
        assert!("OutOf(1,peers)".parse::<PolicyExpr>().is_err());
        assert!("MinPercent(150,batch)".parse::<PolicyExpr>().is_err());
        assert!("OutOf(1,system) garbage".parse::<PolicyExpr>().is_err());
        assert!("".parse::<PolicyExpr>().is_err());
    }

    #[test]
    fn test_min_percent_ceiling() {
        // 51% of 3 batch witnesses requires 2 proofs
        let policy: PolicyExpr = "MinPercent(51,batch)".parse().unwrap();
        assert!(!policy.satisfied(&ctx(&[], &["a", "b", "c"], &["a"])));
        assert!(policy.satisfied(&ctx(&[], &["a", "b", "c"], &["a", "b"])));
    }

    #[test]
    fn test_empty_role_is_vacuously_satisfied() {
        let policy: PolicyExpr = "MinPercent(100,batch)".parse().unwrap();
        assert!(policy.satisfied(&ctx(&[], &[], &[])));

        let policy: PolicyExpr = "OutOf(0,system)".parse().unwrap();
        assert!(policy.satisfied(&ctx(&[], &[], &[])));
    }

    #[test]
    fn test_proofs_outside_role_ignored() {
        let policy: PolicyExpr = "OutOf(1,system)".parse().unwrap();
        // proof from a batch-only witness does not count for system
        assert!(!policy.satisfied(&ctx(&["s1"], &["b1"], &["b1"])));
        assert!(policy.satisfied(&ctx(&["s1"], &["b1"], &["s1"])));
    }

    #[test]
    fn test_and_or_combination() {
        let policy: PolicyExpr = "MinPercent(100,batch) AND OutOf(1,system)".parse().unwrap();
        let c = ctx(&["s1"], &["b1", "b2"], &["b1", "b2"]);
        assert!(!policy.satisfied(&c));

        let c = ctx(&["s1"], &["b1", "b2"], &["b1", "b2", "s1"]);
        assert!(policy.satisfied(&c));
    }

    #[test]
    fn test_monotone_evaluation() {
        let policy: PolicyExpr = "MinPercent(50,batch) OR OutOf(2,system)".parse().unwrap();
        let mut c = ctx(&["s1", "s2"], &["b1", "b2"], &["b1"]);
        assert!(policy.satisfied(&c));

        // extending the proof set never unsatisfies
        c.proofs.insert("b2".to_string());
        c.proofs.insert("s1".to_string());
        c.proofs.insert("s2".to_string());
        assert!(policy.satisfied(&c));
    }
}
