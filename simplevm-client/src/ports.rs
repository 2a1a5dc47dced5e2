//! Gateway port calculation.
//!
//! The gateway forwards one SSH and one UDP port per VM, derived from the last
//! two octets of the VM's fixed IPv4 address. The mapping is configured as two
//! arithmetic expressions over the free variables `x` (last octet) and `y`
//! (second-to-last octet), e.g. `30000 + x + y * 256`. The same expressions
//! are shipped verbatim to Bibigrid as its `portFunction`.

use std::net::Ipv4Addr;

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Num(i64),
    Var(char),
    Op(char),
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
enum Expr {
    Num(i64),
    Var(char),
    Binary(char, Box<Expr>, Box<Expr>),
}

/// A parsed port expression. Whitelisted operators are `+ - * / %`.
#[derive(Debug, Clone)]
pub struct PortExpr {
    raw: String,
    ast: Expr,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '0'..='9' => {
                let mut value: i64 = 0;
                while let Some(&d) = chars.peek() {
                    if let Some(digit) = d.to_digit(10) {
                        value = value
                            .checked_mul(10)
                            .and_then(|v| v.checked_add(digit as i64))
                            .ok_or_else(|| {
                                ClientError::Config(format!(
                                    "port expression constant overflows: {input}"
                                ))
                            })?;
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Num(value));
            }
            'x' | 'y' => {
                tokens.push(Token::Var(c));
                chars.next();
            }
            '+' | '-' | '*' | '/' | '%' => {
                tokens.push(Token::Op(c));
                chars.next();
            }
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            }
            other => {
                return Err(ClientError::Config(format!(
                    "port expression contains unsupported symbol '{other}': {input}"
                )));
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    raw: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.peek();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn err(&self, msg: &str) -> ClientError {
        ClientError::Config(format!("invalid port expression '{}': {msg}", self.raw))
    }

    // term { (+|-) term }
    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            self.bump();
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // factor { (*|/|%) factor }
    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.factor()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek() {
            self.bump();
            let rhs = self.factor()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Expr> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Var(v)) => Ok(Expr::Var(v)),
            Some(Token::Op('-')) => {
                let inner = self.factor()?;
                Ok(Expr::Binary('-', Box::new(Expr::Num(0)), Box::new(inner)))
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.err("missing closing parenthesis")),
                }
            }
            _ => Err(self.err("expected number, variable or parenthesis")),
        }
    }
}

impl PortExpr {
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(ClientError::Config("empty port expression".into()));
        }
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            raw: input,
        };
        let ast = parser.expr()?;
        if parser.pos != tokens.len() {
            return Err(parser.err("trailing tokens"));
        }
        Ok(Self {
            raw: input.to_string(),
            ast,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn eval(&self, x: i64, y: i64) -> Result<i64> {
        eval_expr(&self.ast, x, y, &self.raw)
    }
}

fn eval_expr(expr: &Expr, x: i64, y: i64, raw: &str) -> Result<i64> {
    let non_integer =
        |raw: &str| ClientError::Config(format!("port expression '{raw}' is not integral"));
    match expr {
        Expr::Num(n) => Ok(*n),
        Expr::Var('x') => Ok(x),
        Expr::Var('y') => Ok(y),
        Expr::Var(other) => Err(ClientError::Config(format!(
            "undefined symbol '{other}' in port expression '{raw}'"
        ))),
        Expr::Binary(op, lhs, rhs) => {
            let l = eval_expr(lhs, x, y, raw)?;
            let r = eval_expr(rhs, x, y, raw)?;
            match op {
                '+' => Ok(l + r),
                '-' => Ok(l - r),
                '*' => Ok(l * r),
                '/' => {
                    if r == 0 || l % r != 0 {
                        Err(non_integer(raw))
                    } else {
                        Ok(l / r)
                    }
                }
                '%' => {
                    if r == 0 {
                        Err(non_integer(raw))
                    } else {
                        Ok(l % r)
                    }
                }
                _ => unreachable!("parser only emits whitelisted operators"),
            }
        }
    }
}

/// Maps a fixed IPv4 address to the gateway's forwarded (ssh, udp) ports.
#[derive(Debug, Clone)]
pub struct PortCalculator {
    ssh: PortExpr,
    udp: PortExpr,
}

impl PortCalculator {
    pub fn new(ssh_expr: &str, udp_expr: &str) -> Result<Self> {
        Ok(Self {
            ssh: PortExpr::parse(ssh_expr)?,
            udp: PortExpr::parse(udp_expr)?,
        })
    }

    pub fn ssh_expression(&self) -> &str {
        self.ssh.raw()
    }

    pub fn udp_expression(&self) -> &str {
        self.udp.raw()
    }

    /// `x` is the last octet, `y` the second-to-last.
    pub fn calculate(&self, fixed_ip: &str) -> Result<(u16, u16)> {
        let addr: Ipv4Addr = fixed_ip.parse().map_err(|_| {
            ClientError::Validation(format!("not a valid fixed IPv4 address: {fixed_ip}"))
        })?;
        let [_, _, y, x] = addr.octets();
        let ssh = self.port(&self.ssh, x as i64, y as i64)?;
        let udp = self.port(&self.udp, x as i64, y as i64)?;
        Ok((ssh, udp))
    }

    pub fn ssh_port(&self, fixed_ip: &str) -> Result<u16> {
        Ok(self.calculate(fixed_ip)?.0)
    }

    fn port(&self, expr: &PortExpr, x: i64, y: i64) -> Result<u16> {
        let value = expr.eval(x, y)?;
        u16::try_from(value).map_err(|_| {
            ClientError::Config(format!(
                "port expression '{}' yields {} which is not a valid port",
                expr.raw(),
                value
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_calculation() {
        let calc = PortCalculator::new("30000 + x + y * 256", "30000 + x + y * 256").unwrap();
        let (ssh, udp) = calc.calculate("10.0.2.15").unwrap();
        assert_eq!(ssh, 30000 + 15 + 2 * 256);
        assert_eq!(udp, 30527);
    }

    #[test]
    fn test_precedence_and_parens() {
        let expr = PortExpr::parse("(x + y) * 2").unwrap();
        assert_eq!(expr.eval(3, 4).unwrap(), 14);

        let expr = PortExpr::parse("2 + 3 * 4 - 1").unwrap();
        assert_eq!(expr.eval(0, 0).unwrap(), 13);

        let expr = PortExpr::parse("x % 10").unwrap();
        assert_eq!(expr.eval(27, 0).unwrap(), 7);
    }

    #[test]
    fn test_unknown_symbol_rejected() {
        assert!(PortExpr::parse("30000 + z").is_err());
        assert!(PortExpr::parse("30000 + x; drop").is_err());
    }

    #[test]
    fn test_non_integer_division_rejected() {
        let expr = PortExpr::parse("x / 2").unwrap();
        assert!(expr.eval(5, 0).is_err());
        assert_eq!(expr.eval(6, 0).unwrap(), 3);
        let expr = PortExpr::parse("x / y").unwrap();
        assert!(expr.eval(1, 0).is_err());
    }

    #[test]
    fn test_port_range_checked() {
        let calc = PortCalculator::new("300000 + x", "30000 + x").unwrap();
        assert!(calc.calculate("10.0.2.15").is_err());
    }

    #[test]
    fn test_invalid_ip() {
        let calc = PortCalculator::new("30000 + x", "31000 + x").unwrap();
        assert!(calc.calculate("not-an-ip").is_err());
    }
}
