//! Parsers for durations, aggregate expressions and order-by keys
//!
//! # Supported Syntax
//!
//! ```text
//! duration   := (number unit)+            e.g. 5s, 2m, 1h30m, 7d, 1w, 250ms
//! aggregate  := func '(' column | '*' [, time] ')' [AS alias]
//! order_by   := column [ASC | DESC]
//! ```
//!
//! # Examples
//!
//! ```text
//! avg(temperature) as avg_temp
//! count(*)
//! first(temperature, time)
//! time DESC
//! ```

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{map, map_res, opt, recognize, value},
    multi::many1,
    sequence::{pair, preceded, tuple},
    IResult,
};

use crate::aggregate::error::{AggregateError, AggregateResult};
use crate::aggregate::function::{AggFunc, AggregateExpr};
use crate::storage::{OrderBy, TIME_COLUMN};

const SECOND: i64 = 1000;
const MINUTE: i64 = 60 * SECOND;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;

/// Run a parser over the whole input
fn complete<'a, T>(
    input: &'a str,
    what: &str,
    parser: impl FnOnce(&'a str) -> IResult<&'a str, T>,
) -> AggregateResult<T> {
    match parser(input.trim()) {
        Ok((remaining, parsed)) if remaining.trim().is_empty() => Ok(parsed),
        Ok((remaining, _)) => Err(AggregateError::Parse(format!(
            "Unexpected input after {}: '{}'",
            what,
            remaining.trim()
        ))),
        Err(e) => Err(AggregateError::Parse(format!(
            "Invalid {} '{}': {:?}",
            what,
            input.trim(),
            e
        ))),
    }
}

/// Parse a duration like `5s`, `1h30m` or `7d` into milliseconds
pub fn parse_duration(input: &str) -> AggregateResult<i64> {
    let millis = complete(input, "duration", parse_duration_terms)?;
    if millis <= 0 {
        return Err(AggregateError::Parse(format!(
            "Duration must be positive: '{}'",
            input.trim()
        )));
    }
    Ok(millis)
}

fn parse_duration_terms(input: &str) -> IResult<&str, i64> {
    map(many1(parse_duration_term), |terms| {
        terms.into_iter().fold(0i64, |acc, t| acc.saturating_add(t))
    })(input)
}

/// One `number unit` term
fn parse_duration_term(input: &str) -> IResult<&str, i64> {
    let (input, num) = map_res(digit1, |s: &str| s.parse::<i64>())(input)?;
    let (input, unit) = alt((
        value(1i64, tag_no_case("ms")),
        value(SECOND, tag_no_case("s")),
        value(MINUTE, tag_no_case("m")),
        value(HOUR, tag_no_case("h")),
        value(DAY, tag_no_case("d")),
        value(WEEK, tag_no_case("w")),
    ))(input)?;

    Ok((input, num.saturating_mul(unit)))
}

/// Render milliseconds in the largest exact unit
pub fn format_duration(millis: i64) -> String {
    for (unit, suffix) in [(WEEK, "w"), (DAY, "d"), (HOUR, "h"), (MINUTE, "m"), (SECOND, "s")] {
        if millis != 0 && millis % unit == 0 {
            return format!("{}{}", millis / unit, suffix);
        }
    }
    format!("{}ms", millis)
}

/// Parse an aggregate expression like `avg(temperature) as avg_temp`
pub fn parse_aggregate(input: &str) -> AggregateResult<AggregateExpr> {
    complete(input, "aggregate expression", parse_aggregate_expr)
}

fn parse_aggregate_expr(input: &str) -> IResult<&str, AggregateExpr> {
    let (input, func) = parse_function(input)?;
    let (input, alias) = opt(parse_alias)(input)?;

    let expr = AggregateExpr::new(func);
    Ok((
        input,
        match alias {
            Some(alias) => expr.alias(alias),
            None => expr,
        },
    ))
}

fn parse_function(input: &str) -> IResult<&str, AggFunc> {
    alt((parse_count, parse_column_function))(input)
}

/// `count(*)` or `count(column)`
fn parse_count(input: &str) -> IResult<&str, AggFunc> {
    let (input, _) = tag_no_case("count")(input)?;
    let (input, _) = open_paren(input)?;
    let (input, column) = alt((
        value(None, char('*')),
        map(parse_identifier, |c: &str| Some(c.to_string())),
    ))(input)?;
    let (input, _) = close_paren(input)?;
    Ok((input, AggFunc::Count(column)))
}

/// `func(column)`, with an optional `, time` ordering argument for first/last
fn parse_column_function(input: &str) -> IResult<&str, AggFunc> {
    let (input, name) = alt((
        tag_no_case("sum"),
        tag_no_case("min"),
        tag_no_case("max"),
        tag_no_case("first"),
        tag_no_case("last"),
        tag_no_case("avg"),
        tag_no_case("average"),
    ))(input)?;
    let (input, _) = open_paren(input)?;
    let (input, column) = parse_identifier(input)?;
    let column = column.to_string();

    let name = name.to_ascii_lowercase();
    let ordered = name == "first" || name == "last";
    let (input, _) = if ordered {
        opt(tuple((
            multispace0,
            char(','),
            multispace0,
            tag_no_case(TIME_COLUMN),
        )))(input)?
    } else {
        (input, None)
    };
    let (input, _) = close_paren(input)?;

    let func = match name.as_str() {
        "sum" => AggFunc::Sum(column),
        "min" => AggFunc::Min(column),
        "max" => AggFunc::Max(column),
        "first" => AggFunc::First(column),
        "last" => AggFunc::Last(column),
        _ => AggFunc::Avg(column),
    };
    Ok((input, func))
}

fn open_paren(input: &str) -> IResult<&str, ()> {
    let (input, _) = tuple((multispace0, char('('), multispace0))(input)?;
    Ok((input, ()))
}

fn close_paren(input: &str) -> IResult<&str, ()> {
    let (input, _) = tuple((multispace0, char(')')))(input)?;
    Ok((input, ()))
}

/// Parse AS alias clause
fn parse_alias(input: &str) -> IResult<&str, String> {
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("AS")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, alias) = parse_identifier(input)?;
    Ok((input, alias.to_string()))
}

/// Parse an order-by key like `time DESC`
pub fn parse_order_by(input: &str) -> AggregateResult<OrderBy> {
    complete(input, "order-by key", parse_order_key)
}

fn parse_order_key(input: &str) -> IResult<&str, OrderBy> {
    let (input, column) = parse_identifier(input)?;
    let (input, descending) = opt(preceded(
        multispace1,
        alt((value(false, tag_no_case("ASC")), value(true, tag_no_case("DESC")))),
    ))(input)?;

    Ok((
        input,
        OrderBy {
            column: column.to_string(),
            descending: descending.unwrap_or(false),
        },
    ))
}

/// Parse identifier (column name, alias)
fn parse_identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_alphabetic() || c == '_'),
        take_while(|c: char| c.is_alphanumeric() || c == '_'),
    ))(input)
}

/// Accept a bare number of milliseconds as well as a duration
pub fn parse_millis_or_duration(input: &str) -> AggregateResult<i64> {
    let trimmed = input.trim();
    let bare: IResult<&str, &str> = recognize(pair(opt(tag("-")), digit1))(trimmed);
    match bare {
        Ok(("", digits)) => digits
            .parse()
            .map_err(|e| AggregateError::Parse(format!("Invalid number '{}': {}", digits, e))),
        _ => parse_duration(trimmed),
    }
}
