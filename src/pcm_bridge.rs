use dsp_stream_rs::config::Config;
use dsp_stream_rs::stream::CapturedPeriod;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// 将采集到的 PCM 周期转发给本地 UDP 消费者
/// 每个数据报：1 字节流标识 + 原始 PCM
pub struct PcmBridge {
    socket: UdpSocket,
    target_addr: String,
}

impl PcmBridge {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(format!("0.0.0.0:{}", config.bridge.local_port)).await?;
        let target_addr = format!("{}:{}", config.bridge.remote_ip, config.bridge.remote_port);

        Ok(Self {
            socket,
            target_addr,
        })
    }

    pub async fn run(&self, mut rx: mpsc::Receiver<CapturedPeriod>) -> anyhow::Result<()> {
        let mut datagram = Vec::new();
        while let Some(period) = rx.recv().await {
            datagram.clear();
            datagram.push(period.stream.tag());
            datagram.extend_from_slice(&period.data);
            // 消费者未启动时发送会失败，丢弃该周期即可
            if let Err(e) = self.socket.send_to(&datagram, &self.target_addr).await {
                log::debug!("Failed to forward {} period: {}", period.stream, e);
            }
        }
        Ok(())
    }
}
