use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Encode `m` as a line of newline-delimited JSON, appending to `buf`.
pub fn encode<M: serde::Serialize>(m: &M, buf: &mut Vec<u8>) -> serde_json::Result<()> {
    serde_json::to_writer(&mut *buf, m)?;
    buf.push(b'\n');
    Ok(())
}

/// Map an AsyncBufRead of newline-delimited JSON into a Stream of decoded messages.
/// Blank lines are skipped.
pub fn read_messages<M, R>(reader: R) -> impl futures::Stream<Item = anyhow::Result<M>>
where
    M: for<'de> serde::Deserialize<'de>,
    R: AsyncBufRead + Unpin,
{
    futures::stream::try_unfold((reader, String::new()), |(mut reader, mut line)| async move {
        loop {
            line.clear();

            if reader.read_line(&mut line).await? == 0 {
                return Ok(None); // Graceful EOF.
            } else if !line.ends_with('\n') {
                anyhow::bail!("peer wrote a partial message and then closed its output");
            } else if line.trim().is_empty() {
                continue;
            }

            let message = serde_json::from_str::<M>(&line)
                .with_context(|| format!("could not parse {:?} as a JSON message", line.trim_end()))?;

            return Ok(Some((message, (reader, line))));
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::StreamExt;

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct Ping {
        seq: u32,
    }

    #[tokio::test]
    async fn test_read_messages() {
        let mut buf = Vec::new();
        encode(&Ping { seq: 1 }, &mut buf).unwrap();
        buf.extend_from_slice(b"\n");
        encode(&Ping { seq: 2 }, &mut buf).unwrap();
        buf.extend_from_slice(b"{\"seq\": \"three\"}\n{\"seq\":4}");

        let out: Vec<String> = read_messages::<Ping, _>(buf.as_slice())
            .map(|r| match r {
                Ok(ping) => format!("{ping:?}"),
                Err(err) => format!("{err:#}"),
            })
            .collect()
            .await;

        // The stream ends at the first error.
        assert_eq!(out.len(), 3);
        assert_eq!(out[..2], ["Ping { seq: 1 }", "Ping { seq: 2 }"]);
        assert!(out[2].starts_with(
            r#"could not parse "{\"seq\": \"three\"}" as a JSON message: invalid type"#
        ));

        let out: Vec<_> = read_messages::<Ping, _>(&b"{\"seq\":4}"[..]).collect().await;
        assert_eq!(
            format!("{:#}", out[0].as_ref().unwrap_err()),
            "peer wrote a partial message and then closed its output"
        );
    }
}
