//! nom-based response head parser, enabled with the `nom` feature. The
//! hand-written parser in [`crate::exchange`] stays the default.

use nom::{
    bytes::complete::{tag, take_until},
    error::{context, VerboseError},
    multi::many0,
    sequence::terminated,
};

use crate::exchange::{interpret_head, ResponseHead};
use crate::{Error, Result};

type Res<'a, O> = nom::IResult<&'a str, O, VerboseError<&'a str>>;

fn line(input: &str) -> Res<'_, &str> {
    context("reading line", terminated(take_until("\r\n"), tag("\r\n")))(input)
}

fn head_lines(input: &str) -> Res<'_, (&str, Vec<&str>)> {
    let (input, status_line) = context("status line", line)(input)?;
    let (input, headers) = context("header lines", many0(line))(input)?;
    Ok((input, (status_line, headers)))
}

pub(crate) fn parse_response_head(input: &str) -> Result<ResponseHead> {
    match head_lines(input) {
        Ok((_, (status_line, lines))) => interpret_head(status_line, lines.into_iter()),
        Err(e) => Err(Error::Protocol(format!("malformed response head: {e:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_head() {
        let head = parse_response_head(
            "HTTP/1.1 200 OK\r\nX-HTTPConn-Id: abc\r\nContent-Length: 12\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.conn_id.as_deref(), Some("abc"));
        assert_eq!(head.content_length, 12);
        assert!(!head.eof);
    }

    #[test]
    fn parse_head_with_eof_marker() {
        let head = parse_response_head(
            "HTTP/1.1 200 OK\r\nX-HTTPConn-Id: abc\r\nContent-Length: 0\r\nX-HTTPConn-EOF: true\r\n\r\n",
        )
        .unwrap();
        assert!(head.eof);
    }

    #[test]
    fn parse_garbage() {
        assert!(parse_response_head("no line terminators here").is_err());
    }
}
