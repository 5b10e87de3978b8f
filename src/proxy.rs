use log::debug;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::metrics::Metrics;

const RELAY_BUFFER: usize = 64 * 1024;

/// 单方向拷贝，返回拷贝的字节数
async fn pump<R, W>(mut reader: R, mut writer: W, count: impl Fn(u64)) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.flush().await?;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        // 加密流等写入会先进缓冲，逐段 flush 保证及时送达
        writer.flush().await?;
        total += n as u64;
        count(n as u64);
    }
}

/// 双向转发
///
/// 任一方向遇到 EOF 或错误即结束整个转发，另一方向随之取消；两端在函数
/// 返回时一并释放。返回 (上行字节, 下行字节)。
pub async fn relay<A, B>(client: A, target: B, metrics: &Metrics) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (client_read, mut client_write) = tokio::io::split(client);
    let (target_read, mut target_write) = tokio::io::split(target);

    let up = AtomicU64::new(0);
    let down = AtomicU64::new(0);

    {
        let client_to_target = pump(client_read, &mut target_write, |n| {
            up.fetch_add(n, Ordering::Relaxed);
            metrics.add_bytes_up(n);
        });
        let target_to_client = pump(target_read, &mut client_write, |n| {
            down.fetch_add(n, Ordering::Relaxed);
            metrics.add_bytes_down(n);
        });

        tokio::select! {
            result = client_to_target => if let Err(e) = result {
                debug!("客户端到目标的数据传输结束: {}", e);
            },
            result = target_to_client => if let Err(e) = result {
                debug!("目标到客户端的数据传输结束: {}", e);
            },
        }
    }

    let _ = target_write.shutdown().await;
    let _ = client_write.shutdown().await;
    Ok((up.into_inner(), down.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_copies_and_stops_on_eof() {
        let (mut client, client_side) = duplex(1024);
        let (target_side, mut target) = duplex(1024);
        let metrics = Metrics::new();

        let m = metrics.clone();
        let task = tokio::spawn(async move { relay(client_side, target_side, &m).await });

        client.write_all(b"request").await.unwrap();
        let mut got = [0u8; 7];
        target.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"request");

        target.write_all(b"response!").await.unwrap();
        let mut back = [0u8; 9];
        client.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"response!");

        // 目标关闭后整个转发结束
        drop(target);
        let (up, down) = task.await.unwrap().unwrap();
        assert_eq!((up, down), (7, 9));
        assert_eq!(metrics.snapshot().bytes_up, 7);
        assert_eq!(metrics.snapshot().bytes_down, 9);

        // 客户端一侧随之被关闭
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
