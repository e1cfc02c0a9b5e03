//! Reference [`Calculator`] implementation.
//!
//! Grammar:
//!
//! ```text
//! line   := ident "=" expr | expr
//! expr   := term (("+" | "-") term)*
//! term   := factor (("*" | "/") factor)*
//! factor := number ident? | ident | "(" expr ")" | "-" factor
//! ```
//!
//! An identifier directly after a number is a unit symbol (`2.5 USD`);
//! anywhere else it resolves against the constants map. Addition and
//! subtraction convert across units through the [`UnitTable`]; symbols
//! missing from the table still work between themselves but cannot be
//! mixed.

use std::sync::Arc;

use super::tokenizer::{tokenize, Operator, Token};
use super::{
    CalcError, CalcResult, CalcValue, Calculator, CalculatorFactory, ConstantsMap, Quantity,
    UnitTable,
};

/// One parser instance, bound to the unit table it was built against.
#[derive(Debug, Clone)]
pub struct SimpleCalculator {
    units: UnitTable,
}

impl SimpleCalculator {
    pub fn new(units: UnitTable) -> Self {
        Self { units }
    }

    pub fn units(&self) -> &UnitTable {
        &self.units
    }
}

impl Calculator for SimpleCalculator {
    #[tracing::instrument(level = "trace", skip(self, constants))]
    fn parse(&self, input: &str, constants: &ConstantsMap) -> CalcResult<CalcValue> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(CalcError::Parse {
                input: input.to_string(),
                message: "empty input".to_string(),
            });
        }

        // 先頭の "ident =" は代入行
        if tokens.len() >= 2 {
            if let (Token::Identifier(identifier), Token::Operator(Operator::Equals)) =
                (&tokens[0], &tokens[1])
            {
                let mut parser = ExprParser::new(input, &tokens[2..], constants, &self.units);
                let value = parser.expression()?;
                parser.expect_end()?;
                return Ok(CalcValue::assignment(
                    identifier.clone(),
                    CalcValue::Number(value),
                ));
            }
        }

        let mut parser = ExprParser::new(input, &tokens, constants, &self.units);
        let value = parser.expression()?;
        parser.expect_end()?;
        Ok(CalcValue::Number(value))
    }

    fn add(&self, left: &CalcValue, right: &CalcValue) -> CalcResult<CalcValue> {
        match (left, right) {
            (CalcValue::Number(a), CalcValue::Number(b)) => {
                Ok(CalcValue::Number(add_quantities(a, b, &self.units)?))
            }
            (CalcValue::Error(message), _) | (_, CalcValue::Error(message)) => {
                Ok(CalcValue::Error(message.clone()))
            }
            _ => Err(CalcError::Unsupported {
                message: format!("cannot add {} and {}", left, right),
            }),
        }
    }

    fn format(&self, value: &CalcValue) -> String {
        match value {
            CalcValue::Number(quantity) => match &quantity.unit {
                Some(unit) => format!("{} {}", format_magnitude(quantity.magnitude), unit),
                None => format_magnitude(quantity.magnitude),
            },
            CalcValue::Assignment { identifier, value } => {
                format!("{} = {}", identifier, self.format(value))
            }
            CalcValue::Error(message) => message.clone(),
        }
    }
}

/// Builds [`SimpleCalculator`] instances; one per section, rebuilt after a
/// unit-table change.
#[derive(Debug, Clone, Default)]
pub struct SimpleCalculatorFactory;

impl CalculatorFactory for SimpleCalculatorFactory {
    fn instance(&self, units: &UnitTable) -> Arc<dyn Calculator> {
        Arc::new(SimpleCalculator::new(units.clone()))
    }
}

struct ExprParser<'a> {
    input: &'a str,
    tokens: &'a [Token],
    position: usize,
    constants: &'a ConstantsMap,
    units: &'a UnitTable,
}

impl<'a> ExprParser<'a> {
    fn new(
        input: &'a str,
        tokens: &'a [Token],
        constants: &'a ConstantsMap,
        units: &'a UnitTable,
    ) -> Self {
        Self {
            input,
            tokens,
            position: 0,
            constants,
            units,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> CalcError {
        CalcError::Parse {
            input: self.input.to_string(),
            message: message.into(),
        }
    }

    fn expect_end(&self) -> CalcResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(self.error(format!("unexpected token {:?}", token))),
        }
    }

    fn expression(&mut self) -> CalcResult<Quantity> {
        let mut left = self.term()?;
        while let Some(&Token::Operator(op)) = self.peek() {
            if op != Operator::Plus && op != Operator::Minus {
                break;
            }
            self.position += 1;
            let right = self.term()?;
            left = match op {
                Operator::Plus => add_quantities(&left, &right, self.units)?,
                _ => sub_quantities(&left, &right, self.units)?,
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> CalcResult<Quantity> {
        let mut left = self.factor()?;
        while let Some(&Token::Operator(op)) = self.peek() {
            if op != Operator::Star && op != Operator::Slash {
                break;
            }
            self.position += 1;
            let right = self.factor()?;
            left = match op {
                Operator::Star => mul_quantities(&left, &right)?,
                _ => div_quantities(&left, &right, self.units)?,
            };
        }
        Ok(left)
    }

    fn factor(&mut self) -> CalcResult<Quantity> {
        match self.next() {
            Some(Token::Number(magnitude)) => {
                let unit = if let Some(Token::Identifier(unit)) = self.peek() {
                    let unit = unit.clone();
                    self.position += 1;
                    Some(unit)
                } else {
                    None
                };
                Ok(Quantity::new(magnitude, unit))
            }
            Some(Token::Identifier(name)) => self.lookup(&name),
            Some(Token::LeftParen) => {
                let value = self.expression()?;
                match self.next() {
                    Some(Token::RightParen) => Ok(value),
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(Token::Operator(Operator::Minus)) => {
                let value = self.factor()?;
                Ok(Quantity::new(-value.magnitude, value.unit))
            }
            Some(token) => Err(self.error(format!("unexpected token {:?}", token))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn lookup(&self, name: &str) -> CalcResult<Quantity> {
        match self.constants.get(name) {
            Some(CalcValue::Number(quantity)) => Ok(quantity.clone()),
            Some(other) => Err(CalcError::Unsupported {
                message: format!("constant '{}' is not a number: {}", name, other),
            }),
            None => Err(CalcError::UnknownIdentifier {
                identifier: name.to_string(),
            }),
        }
    }
}

fn add_quantities(left: &Quantity, right: &Quantity, units: &UnitTable) -> CalcResult<Quantity> {
    combine(left, right, units, |a, b| a + b)
}

fn sub_quantities(left: &Quantity, right: &Quantity, units: &UnitTable) -> CalcResult<Quantity> {
    combine(left, right, units, |a, b| a - b)
}

/// Additive combination. A unitless operand adopts the other side's unit;
/// mixed units are converted through the table into the left unit.
fn combine(
    left: &Quantity,
    right: &Quantity,
    units: &UnitTable,
    op: impl Fn(f64, f64) -> f64,
) -> CalcResult<Quantity> {
    match (&left.unit, &right.unit) {
        (None, None) => Ok(Quantity::unitless(op(left.magnitude, right.magnitude))),
        (Some(unit), None) | (None, Some(unit)) => Ok(Quantity::new(
            op(left.magnitude, right.magnitude),
            Some(unit.clone()),
        )),
        (Some(a), Some(b)) if a == b => Ok(Quantity::new(
            op(left.magnitude, right.magnitude),
            Some(a.clone()),
        )),
        (Some(a), Some(b)) => match units.convert(right.magnitude, b, a) {
            Some(converted) => Ok(Quantity::new(op(left.magnitude, converted), Some(a.clone()))),
            None => Err(CalcError::IncompatibleUnits {
                left: a.clone(),
                right: b.clone(),
            }),
        },
    }
}

fn mul_quantities(left: &Quantity, right: &Quantity) -> CalcResult<Quantity> {
    match (&left.unit, &right.unit) {
        (None, None) => Ok(Quantity::unitless(left.magnitude * right.magnitude)),
        (Some(unit), None) | (None, Some(unit)) => Ok(Quantity::new(
            left.magnitude * right.magnitude,
            Some(unit.clone()),
        )),
        (Some(a), Some(b)) => Err(CalcError::Unsupported {
            message: format!("cannot multiply {} by {}", a, b),
        }),
    }
}

fn div_quantities(left: &Quantity, right: &Quantity, units: &UnitTable) -> CalcResult<Quantity> {
    if right.magnitude == 0.0 {
        return Err(CalcError::DivisionByZero);
    }
    match (&left.unit, &right.unit) {
        (None, None) => Ok(Quantity::unitless(left.magnitude / right.magnitude)),
        (Some(unit), None) => Ok(Quantity::new(
            left.magnitude / right.magnitude,
            Some(unit.clone()),
        )),
        (Some(a), Some(b)) if a == b => {
            Ok(Quantity::unitless(left.magnitude / right.magnitude))
        }
        (Some(a), Some(b)) => match units.convert(right.magnitude, b, a) {
            Some(converted) if converted != 0.0 => {
                Ok(Quantity::unitless(left.magnitude / converted))
            }
            Some(_) => Err(CalcError::DivisionByZero),
            None => Err(CalcError::IncompatibleUnits {
                left: a.clone(),
                right: b.clone(),
            }),
        },
        (None, Some(b)) => Err(CalcError::Unsupported {
            message: format!("cannot divide a plain number by {}", b),
        }),
    }
}

/// Rounds away float noise before display, so `0.1 + 0.2` renders as `0.3`.
fn format_magnitude(magnitude: f64) -> String {
    let rounded = (magnitude * 1e10).round() / 1e10;
    format!("{}", rounded)
}
