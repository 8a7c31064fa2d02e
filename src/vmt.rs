use anyhow::{Context, Result};
use rosc::{encoder, OscMessage, OscPacket, OscType};
use std::net::UdpSocket;

use crate::geometry::PoseSample;

/// VMTのデフォルトアドレス
pub const VMT_DEFAULT_ADDR: &str = "127.0.0.1:39570";

/// ドライバ空間（右手系、ルーム座標）
pub const VMT_ROOM_DRIVER: &str = "/VMT/Room/Driver";

pub const ENABLE_DISABLED: i32 = 0;
pub const ENABLE_TRACKER: i32 = 1;

/// トラッカーの位置と回転
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerPose {
    /// 位置 (x, y, z)
    pub position: [f32; 3],
    /// 回転 (クォータニオン: x, y, z, w)
    pub rotation: [f32; 4],
}

impl TrackerPose {
    pub fn new(position: [f32; 3], rotation: [f32; 4]) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self {
            position: [0.0, 0.0, 0.0],
            rotation: [0.0, 0.0, 0.0, 1.0],
        }
    }

    pub fn from_sample(sample: &PoseSample) -> Self {
        let p = sample.position;
        let q = sample.orientation.quaternion();
        Self {
            position: [p.x as f32, p.y as f32, p.z as f32],
            rotation: [q.i as f32, q.j as f32, q.k as f32, q.w as f32],
        }
    }
}

/// VMTへ送信するOSCメッセージを構築
/// 引数: index, enable, timeoffset, x, y, z, qx, qy, qz, qw
pub fn build_osc_message(index: i32, enable: i32, pose: &TrackerPose) -> OscMessage {
    OscMessage {
        addr: VMT_ROOM_DRIVER.to_string(),
        args: vec![
            OscType::Int(index),
            OscType::Int(enable),
            OscType::Float(0.0), // timeoffset
            OscType::Float(pose.position[0]),
            OscType::Float(pose.position[1]),
            OscType::Float(pose.position[2]),
            OscType::Float(pose.rotation[0]),
            OscType::Float(pose.rotation[1]),
            OscType::Float(pose.rotation[2]),
            OscType::Float(pose.rotation[3]),
        ],
    }
}

pub fn encode_osc_message(msg: &OscMessage) -> Result<Vec<u8>> {
    let packet = OscPacket::Message(msg.clone());
    let encoded = encoder::encode(&packet)?;
    Ok(encoded)
}

/// ポーズの送り先
pub trait PoseSink {
    fn send(&self, index: i32, enable: i32, pose: &TrackerPose) -> Result<()>;

    /// None（ロスト）は enable=0 で送って無効化する
    fn send_sample(&self, index: i32, sample: Option<&PoseSample>) -> Result<()> {
        match sample {
            Some(s) if s.valid => self.send(index, ENABLE_TRACKER, &TrackerPose::from_sample(s)),
            _ => self.send(index, ENABLE_DISABLED, &TrackerPose::identity()),
        }
    }
}

/// VMTクライアント
pub struct VmtClient {
    socket: UdpSocket,
    target_addr: String,
}

impl VmtClient {
    pub fn new(target_addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").context("Failed to bind UDP socket")?;
        Ok(Self {
            socket,
            target_addr: target_addr.to_string(),
        })
    }

    pub fn target_addr(&self) -> &str {
        &self.target_addr
    }
}

impl PoseSink for VmtClient {
    fn send(&self, index: i32, enable: i32, pose: &TrackerPose) -> Result<()> {
        let msg = build_osc_message(index, enable, pose);
        let data = encode_osc_message(&msg)?;
        self.socket
            .send_to(&data, &self.target_addr)
            .with_context(|| format!("Failed to send to {}", self.target_addr))?;
        Ok(())
    }
}
