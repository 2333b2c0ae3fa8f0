//! Line-delimited JSON framing for the supervisor/worker pipes

use crate::error::SupervisorError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

/// Serialize `value` as one line and flush it
pub async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<(), SupervisorError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one JSON value per line. Blank lines are skipped.
pub struct LineReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next decoded value, `None` once the pipe is closed.
    ///
    /// Cancel safe: a partially read line is kept for the next call.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, SupervisorError> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(&line)?));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brd_types::{WorkerCommand, WorkerMessage};

    #[tokio::test]
    async fn test_lines_are_framed_and_skipped_when_blank() {
        let (mut client, server) = tokio::io::duplex(1024);

        write_line(&mut client, &WorkerCommand::Disconnect).await.unwrap();
        client.write_all(b"\n   \n").await.unwrap();
        write_line(&mut client, &WorkerMessage::completed(7)).await.unwrap();
        drop(client);

        let mut reader = LineReader::new(server);
        assert_eq!(
            reader.next::<WorkerCommand>().await.unwrap(),
            Some(WorkerCommand::Disconnect)
        );
        assert_eq!(
            reader.next::<WorkerMessage>().await.unwrap(),
            Some(WorkerMessage::completed(7))
        );
        assert_eq!(reader.next::<WorkerCommand>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_garbage_line_is_a_serialization_error() {
        let input: &[u8] = b"not json\n";
        let mut reader = LineReader::new(input);
        let err = reader.next::<WorkerCommand>().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_eof_yields_none() {
        let input: &[u8] = b"";
        let mut reader = LineReader::new(input);
        assert_eq!(reader.next::<WorkerCommand>().await.unwrap(), None);
    }
}
