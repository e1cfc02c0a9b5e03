//! Tokenizer for the reference calculator grammar.
//!
//! One line of input becomes a flat token list; the expression grammar in
//! [`super::simple`] consumes it. Lines never span multiple inputs, so no
//! position tracking is needed.

use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use nom::{
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, digit1},
    combinator::{map, map_res, opt, recognize},
    error::{context, VerboseError},
    sequence::{pair, tuple},
    IResult,
};

use super::{CalcError, CalcResult};

pub type ParserResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Identifier(String),
    Operator(Operator),
    LeftParen,
    RightParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, AsRefStr, EnumIter)]
pub enum Operator {
    #[strum(serialize = "+")]
    Plus,
    #[strum(serialize = "-")]
    Minus,
    #[strum(serialize = "*")]
    Star,
    #[strum(serialize = "/")]
    Slash,
    #[strum(serialize = "=")]
    Equals,
}

fn parse_number(input: &str) -> ParserResult<Token> {
    context(
        "number",
        map_res(
            recognize(tuple((digit1, opt(tuple((char('.'), digit1)))))),
            |s: &str| s.parse::<f64>().map(Token::Number),
        ),
    )(input)
}

fn parse_identifier(input: &str) -> ParserResult<Token> {
    context(
        "identifier",
        map(
            recognize(pair(
                take_while1(|c: char| c.is_alphabetic() || c == '_'),
                take_while(|c: char| c.is_alphanumeric() || c == '_'),
            )),
            |ident: &str| Token::Identifier(ident.to_string()),
        ),
    )(input)
}

fn parse_operator(input: &str) -> ParserResult<Token> {
    context(
        "operator",
        alt((
            map(char('+'), |_| Token::Operator(Operator::Plus)),
            map(char('-'), |_| Token::Operator(Operator::Minus)),
            map(char('*'), |_| Token::Operator(Operator::Star)),
            map(char('/'), |_| Token::Operator(Operator::Slash)),
            map(char('='), |_| Token::Operator(Operator::Equals)),
        )),
    )(input)
}

fn parse_delimiter(input: &str) -> ParserResult<Token> {
    context(
        "delimiter",
        alt((
            map(char('('), |_| Token::LeftParen),
            map(char(')'), |_| Token::RightParen),
        )),
    )(input)
}

#[tracing::instrument(level = "trace", skip(input))]
pub fn tokenize(input: &str) -> CalcResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut remaining = input.trim_start();

    while !remaining.is_empty() {
        let result = alt((
            parse_number,
            parse_operator,
            parse_delimiter,
            parse_identifier,
        ))(remaining);

        match result {
            Ok((new_remaining, token)) => {
                tokens.push(token);
                remaining = new_remaining.trim_start();
            }
            Err(nom::Err::Incomplete(needed)) => {
                return Err(CalcError::Parse {
                    input: input.to_string(),
                    message: format!("Incomplete input, {:?}", needed),
                });
            }
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
                return Err(CalcError::Parse {
                    input: input.to_string(),
                    message: nom::error::convert_error(remaining, e),
                });
            }
        }
    }

    Ok(tokens)
}
