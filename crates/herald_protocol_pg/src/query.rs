//! Parsed-query variants and the responses they produce. Results never
//! emit `ReadyForQuery` themselves; that is the writer's job, driven by
//! the `sync_after` flag travelling alongside each result.

use tokio::io::AsyncWrite;

use crate::codec::{BackendMessage, FieldDescription, MessageWriter};

/// The accepted query grammar, one variant per recognized form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedQuery {
    Empty,
    /// `SELECT 1`, with an optional trailing semicolon.
    TrivialSelect,
    Listen(String),
    Unlisten(String),
    UnlistenAll,
    /// The literal `SET extra_float_digits = 3`, accepted as a no-op for
    /// JDBC 9.1–9.3.
    NopSet,
}

impl ParsedQuery {
    /// The response to a `Describe` of this query: only the trivial SELECT
    /// produces rows.
    pub fn describe(&self) -> QueryResult {
        match self {
            ParsedQuery::TrivialSelect => QueryResult::RowDescription,
            _ => QueryResult::NoData,
        }
    }

    /// Whether the simple-query path must send a row description before
    /// the processed result. Mirrors the upstream server, which only sends
    /// the description when there is one.
    pub fn has_row_description(&self) -> bool {
        matches!(self, ParsedQuery::TrivialSelect)
    }
}

/// A single response unit handed from the decoder to the writer through
/// the result channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    EmptyQuery,
    CommandComplete(&'static str),
    /// The single `1` row of the trivial SELECT, plus its command tag.
    TrivialSelectRows,
    RowDescription,
    NoData,
    ParseComplete,
    BindComplete,
    Error {
        sqlstate: &'static str,
        message: String,
    },
    /// Emits nothing; carries a `sync_after` on its own (used to answer
    /// `Sync` and to finish the post-parse-failure resync).
    Nop,
}

impl QueryResult {
    /// Write this result's frames. Flushing is left to the writer loop.
    pub async fn respond<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut MessageWriter<W>,
    ) -> std::io::Result<()> {
        match self {
            QueryResult::EmptyQuery => writer.send(&BackendMessage::EmptyQueryResponse).await,
            QueryResult::CommandComplete(tag) => {
                writer
                    .send(&BackendMessage::CommandComplete {
                        tag: (*tag).to_string(),
                    })
                    .await
            }
            QueryResult::TrivialSelectRows => {
                writer
                    .send(&BackendMessage::DataRow {
                        values: vec![Some(b"1".to_vec())],
                    })
                    .await?;
                writer
                    .send(&BackendMessage::CommandComplete {
                        tag: "SELECT".to_string(),
                    })
                    .await
            }
            QueryResult::RowDescription => {
                writer
                    .send(&BackendMessage::RowDescription {
                        fields: vec![trivial_select_field()],
                    })
                    .await
            }
            QueryResult::NoData => writer.send(&BackendMessage::NoData).await,
            QueryResult::ParseComplete => writer.send(&BackendMessage::ParseComplete).await,
            QueryResult::BindComplete => writer.send(&BackendMessage::BindComplete).await,
            QueryResult::Error { sqlstate, message } => {
                writer
                    .send(&BackendMessage::ErrorResponse {
                        severity: "ERROR",
                        code: *sqlstate,
                        message: message.clone(),
                    })
                    .await
            }
            QueryResult::Nop => Ok(()),
        }
    }
}

/// The `?column?` int4 field of the trivial SELECT.
fn trivial_select_field() -> FieldDescription {
    FieldDescription {
        name: "?column?".to_string(),
        table_oid: 0,
        column_attr: 0,
        type_oid: 23,
        type_len: 4,
        type_modifier: 0,
        format_code: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_trivial_select_describes_rows() {
        assert_eq!(ParsedQuery::TrivialSelect.describe(), QueryResult::RowDescription);
        assert!(ParsedQuery::TrivialSelect.has_row_description());
        for q in [
            ParsedQuery::Empty,
            ParsedQuery::Listen("c".into()),
            ParsedQuery::Unlisten("c".into()),
            ParsedQuery::UnlistenAll,
            ParsedQuery::NopSet,
        ] {
            assert_eq!(q.describe(), QueryResult::NoData);
            assert!(!q.has_row_description());
        }
    }

    #[tokio::test]
    async fn trivial_select_rows_frames() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut writer = MessageWriter::new(server);
        QueryResult::TrivialSelectRows
            .respond(&mut writer)
            .await
            .unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut buf)
            .await
            .unwrap();
        // DataRow: one column, value "1"
        assert_eq!(buf[0], b'D');
        assert_eq!(&buf[5..7], &1i16.to_be_bytes());
        assert_eq!(&buf[7..11], &1i32.to_be_bytes());
        assert_eq!(buf[11], b'1');
        // CommandComplete("SELECT")
        assert_eq!(buf[12], b'C');
        assert!(buf[12..].windows(7).any(|w| w == b"SELECT\x00"));
    }

    #[tokio::test]
    async fn row_description_is_the_unnamed_int4_column() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut writer = MessageWriter::new(server);
        QueryResult::RowDescription
            .respond(&mut writer)
            .await
            .unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf[0], b'T');
        assert_eq!(&buf[5..7], &1i16.to_be_bytes());
        assert!(buf.windows(9).any(|w| w == b"?column?\x00"));
        // type oid 23 right after the name and table oid/attr
        let name_end = 7 + "?column?".len() + 1;
        let oid_start = name_end + 4 + 2;
        assert_eq!(&buf[oid_start..oid_start + 4], &23i32.to_be_bytes());
    }

    #[tokio::test]
    async fn nop_emits_nothing() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut writer = MessageWriter::new(server);
        QueryResult::Nop.respond(&mut writer).await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut buf)
            .await
            .unwrap();
        assert!(buf.is_empty());
    }
}
