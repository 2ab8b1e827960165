use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

/// 3次元ベクトル（位置・方向の両方に使用）
///
/// z軸を上方向とする右手系。水平面はXY平面です。
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64, // m
    pub y: f64, // m
    pub z: f64, // m (高さ)
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };
    pub const UP: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 1.0 };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// ベクトルの長さ
    pub fn length(&self) -> f64 {
        (self.x.powi(2) + self.y.powi(2) + self.z.powi(2)).sqrt()
    }

    /// XY平面での長さ
    pub fn length_xy(&self) -> f64 {
        (self.x.powi(2) + self.y.powi(2)).sqrt()
    }

    /// 3次元距離を計算
    pub fn distance(&self, other: &Vec3) -> f64 {
        (*self - *other).length()
    }

    /// XY平面での2次元距離を計算
    pub fn distance_xy(&self, other: &Vec3) -> f64 {
        (*self - *other).length_xy()
    }

    /// 正規化（ゼロベクトルはそのまま返す）
    pub fn normalized(&self) -> Self {
        let len = self.length();
        if len > 1e-12 { *self * (1.0 / len) } else { *self }
    }

    pub fn dot(&self, other: &Vec3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(&self, other: &Vec3) -> Vec3 {
        Vec3::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    /// 高さ成分を落としたベクトル
    pub fn flattened(&self) -> Self {
        Vec3::new(self.x, self.y, 0.0)
    }

    pub fn is_near_zero(&self) -> bool {
        self.length() < 1e-9
    }

    /// 2つのベクトルのなす角（度）
    pub fn angle_between_deg(&self, other: &Vec3) -> f64 {
        let denom = self.length() * other.length();
        if denom < 1e-12 {
            return 0.0;
        }
        let cos = (self.dot(other) / denom).clamp(-1.0, 1.0);
        math_utils::rad_to_deg(cos.acos())
    }
}

impl Add for Vec3 {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;

    fn sub(self, other: Self) -> Self::Output {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Self;

    fn mul(self, scalar: f64) -> Self::Output {
        Self::new(self.x * scalar, self.y * scalar, self.z * scalar)
    }
}

impl Neg for Vec3 {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Self::new(-self.x, -self.y, -self.z)
    }
}

impl fmt::Display for Vec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// 方位角（度、X軸基準・反時計回り）から前方単位ベクトルを求める
pub fn forward_from_yaw(yaw_deg: f64) -> Vec3 {
    let rad = math_utils::deg_to_rad(yaw_deg);
    Vec3::new(rad.cos(), rad.sin(), 0.0)
}

/// 方位角から右方向単位ベクトルを求める
pub fn right_from_yaw(yaw_deg: f64) -> Vec3 {
    let rad = math_utils::deg_to_rad(yaw_deg);
    Vec3::new(rad.sin(), -rad.cos(), 0.0)
}

/// `from`から`to`へ向く方位角（度）
pub fn yaw_towards(from: Vec3, to: Vec3) -> Option<f64> {
    let dir = (to - from).flattened();
    if dir.is_near_zero() {
        return None;
    }
    Some(math_utils::rad_to_deg(dir.y.atan2(dir.x)))
}

/// エージェントのハンドル（ワールド内のアリーナ添字）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub u32);

impl AgentId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A{:03}", self.0)
    }
}

/// カバーポイントのハンドル（登録順に採番、再利用しない）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoverId(pub u32);

impl CoverId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CoverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{:03}", self.0)
    }
}

/// 姿勢
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Posture {
    #[default]
    Standing,
    Crouching,
}

/// エージェントの生存状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Active,    // 行動中
    Dead,      // 死亡（破棄待ち）
    Destroyed, // シミュレーションから除去済み
}

/// 数学ユーティリティ関数
pub mod math_utils {
    /// 度をラジアンに変換
    pub fn deg_to_rad(degrees: f64) -> f64 {
        degrees * std::f64::consts::PI / 180.0
    }

    /// ラジアンを度に変換
    pub fn rad_to_deg(radians: f64) -> f64 {
        radians * 180.0 / std::f64::consts::PI
    }
}
