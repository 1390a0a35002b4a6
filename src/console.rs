//! Line-oriented transport: one command per input line, one reply per
//! output line.
//!
//! Each line reads `<type> <body>`; everything after the first whitespace
//! character is the body, so a bare `<type>` is a command with an empty
//! body. Lines are processed strictly one after another: the reply to a
//! line is written before the next line is read.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::Command;
use crate::error::{ParseError, PostError};
use crate::mailbox::Postbox;

/// Parse one input line into a command.
///
/// # Errors
///
/// Returns [`ParseError::MissingType`] for a blank line.
///
/// # Examples
///
/// ```
/// use command_postbox::console::parse_line;
///
/// let cmd = parse_line("deposit 25").unwrap();
/// assert_eq!((cmd.command_type.as_str(), cmd.body.as_str()), ("deposit", "25"));
///
/// let bare = parse_line("ping").unwrap();
/// assert_eq!(bare.body, "");
/// ```
pub fn parse_line(line: &str) -> Result<Command, ParseError> {
    let line = line.trim_start().trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Err(ParseError::MissingType);
    }

    let command = match line.split_once(char::is_whitespace) {
        Some((command_type, body)) => Command::new(command_type, body),
        None => Command::new(line, ""),
    };
    Ok(command)
}

/// Serve commands read from `input`, writing each reply to `output`.
///
/// Parse failures and replies that never arrived are written as
/// `error: <reason>` and the loop moves on. If the mailbox is closed the
/// error is written and serving stops.
///
/// # Returns
///
/// The number of commands the worker answered.
///
/// # Errors
///
/// Returns `io::Error` if reading `input` or writing `output` fails.
pub async fn serve_lines<R, W>(postbox: &Postbox, input: R, mut output: W) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut answered = 0;

    while let Some(line) = lines.next_line().await? {
        let (reply, closed) = match parse_line(&line) {
            Ok(command) => match postbox.post(command).await {
                Ok(text) => {
                    answered += 1;
                    (text, false)
                }
                Err(e) => (format!("error: {e}"), e == PostError::Closed),
            },
            Err(e) => (format!("error: {e}"), false),
        };

        output.write_all(reply.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;

        if closed {
            tracing::info!("mailbox closed, console stops reading");
            break;
        }
    }

    Ok(answered)
}
