//! Radio primitives: modulation and coding schemes, bit error rates, noise
//! and in-flight transmissions.

use crate::position::Device;
use crate::SimTime;
use ncsim_packet::Packet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt;
use std::sync::OnceLock;

/// Boltzmann constant in J/K.
pub const BOLTZMANN: f64 = 1.380_649e-23;

/// Default receiver temperature in °C.
pub const DEFAULT_TEMPERATURE_C: f64 = 20.0;

/// Default bit rate in bits per second.
pub const DEFAULT_BIT_RATE: f64 = 100e3;

// ============================================================================
// Helper functions
// ============================================================================

/// Convert dBm to milliwatts.
pub fn dbm_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

/// Convert milliwatts to dBm.
pub fn mw_to_dbm(mw: f64) -> f64 {
    10.0 * mw.log10()
}

/// Thermal noise power density in W/Hz at a temperature in °C.
pub fn noise_power_density(celsius: f64) -> f64 {
    BOLTZMANN * (celsius + 273.15)
}

/// Thermal noise power in mW over `bandwidth_hz` at a temperature in °C.
pub fn thermal_noise_mw(bandwidth_hz: f64, celsius: f64) -> f64 {
    noise_power_density(celsius) * bandwidth_hz * 1000.0
}

/// Eb/N0 (linear) for signal and noise powers in dBm at `bit_rate` bps.
pub fn eb_n0_ratio(signal_dbm: f64, noise_dbm: f64, bit_rate: f64) -> f64 {
    let ratio_db = signal_dbm - noise_dbm - 10.0 * bit_rate.log10();
    10f64.powf(ratio_db / 10.0)
}

fn erfc(x: f64) -> f64 {
    // Abramowitz & Stegun 7.1.26
    let t = 1.0 / (1.0 + 0.3275911 * x.abs());
    let poly = t * (0.254829592 + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let result = poly * (-x * x).exp();
    if x >= 0.0 {
        result
    } else {
        2.0 - result
    }
}

/// Gaussian tail probability Q(x). Uses the asymptotic form above 3 and
/// the erfc approximation below.
pub fn q_function(x: f64) -> f64 {
    if x > 3.0 {
        1.0 / (x * (2.0 * PI).sqrt()) * (-(x * x) / 2.0).exp()
    } else {
        0.5 * erfc(x / std::f64::consts::SQRT_2)
    }
}

// ============================================================================
// Modulation and coding
// ============================================================================

/// Modulation of an [`Mcs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modulation {
    /// Binary phase-shift keying.
    Bpsk,
}

/// A code rate `k/n`, kept in lowest terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeRate {
    k: u32,
    n: u32,
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

impl CodeRate {
    /// Create `k/n`. Returns `None` unless `0 < k <= n`.
    pub fn new(k: u32, n: u32) -> Option<Self> {
        if k == 0 || k > n {
            return None;
        }
        let g = gcd(k, n);
        Some(CodeRate { k: k / g, n: n / g })
    }

    /// Information bits per block.
    pub fn k(&self) -> u32 {
        self.k
    }

    /// Total bits per block.
    pub fn n(&self) -> u32 {
        self.n
    }
}

impl Default for CodeRate {
    fn default() -> Self {
        CodeRate { k: 1, n: 2 }
    }
}

impl fmt::Display for CodeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.k, self.n)
    }
}

fn max_ber_cache() -> &'static Mutex<HashMap<CodeRate, f64>> {
    static CACHE: OnceLock<Mutex<HashMap<CodeRate, f64>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A modulation and coding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mcs {
    /// Modulation.
    pub modulation: Modulation,
    /// Code rate.
    pub code_rate: CodeRate,
    /// Bit rate in bits per second.
    pub bit_rate: f64,
}

impl Default for Mcs {
    fn default() -> Self {
        Mcs::bpsk(CodeRate::default(), DEFAULT_BIT_RATE)
    }
}

impl Mcs {
    /// A BPSK scheme.
    pub fn bpsk(code_rate: CodeRate, bit_rate: f64) -> Self {
        Mcs {
            modulation: Modulation::Bpsk,
            code_rate,
            bit_rate,
        }
    }

    /// Bit error rate for signal and noise powers in dBm at `bit_rate` bps.
    pub fn bit_error_rate(&self, signal_dbm: f64, noise_dbm: f64, bit_rate: f64) -> f64 {
        match self.modulation {
            Modulation::Bpsk => {
                let ratio = eb_n0_ratio(signal_dbm, noise_dbm, bit_rate);
                q_function((2.0 * ratio).sqrt())
            }
        }
    }

    /// Highest bit error rate the code can correct, from the
    /// Varshamov-Gilbert bound: the largest `t` with
    /// `sum_{i<t} C(n, i) <= 2^(n-k)` errors per `k` information bits.
    /// Memoized per code rate.
    pub fn max_correctable_ber(&self) -> f64 {
        if let Some(ber) = max_ber_cache().lock().get(&self.code_rate) {
            return *ber;
        }
        let k = self.code_rate.k();
        let n = self.code_rate.n();
        let bound = 2f64.powi((n - k) as i32);
        let mut sum = 0.0;
        let mut binom = 1.0;
        let mut t: u32 = 0;
        while sum <= bound && t <= n {
            sum += binom;
            binom = binom * f64::from(n - t) / f64::from(t + 1);
            t += 1;
        }
        let ber = f64::from(t - 1) / f64::from(k);
        max_ber_cache().lock().insert(self.code_rate, ber);
        ber
    }
}

// ============================================================================
// Link settings and transmissions
// ============================================================================

/// Transmit parameters used by a protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkSettings {
    /// Transmit power in dBm.
    pub power_dbm: f64,
    /// Scheme for header and payload.
    pub mcs: Mcs,
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            power_dbm: 0.0,
            mcs: Mcs::default(),
        }
    }
}

/// A frame on the air. Immutable once created.
#[derive(Debug, Clone)]
pub struct Transmission {
    /// Id, unique within the band.
    pub id: u64,
    /// Sending device.
    pub sender: Device,
    /// Transmit power in dBm.
    pub power_dbm: f64,
    /// Packet being sent.
    pub packet: Packet,
    /// Scheme used for the header.
    pub mcs_header: Mcs,
    /// Scheme used for the payload.
    pub mcs_payload: Mcs,
    /// Start time.
    pub start: SimTime,
    /// Time needed for the header.
    pub header_duration: SimTime,
    /// Time needed for the whole frame.
    pub duration: SimTime,
    /// Last instant the transmission is active.
    pub stop: SimTime,
}

impl Transmission {
    /// Create a transmission starting at `start`.
    pub fn new(
        id: u64,
        sender: Device,
        power_dbm: f64,
        packet: Packet,
        mcs_header: Mcs,
        mcs_payload: Mcs,
        start: SimTime,
    ) -> Self {
        let header_secs = (packet.header.byte_size() * 8) as f64 / mcs_header.bit_rate;
        let payload_secs = (packet.payload.byte_size() * 8) as f64 / mcs_payload.bit_rate;
        let header_duration = SimTime::from_secs(header_secs);
        let duration = SimTime::from_secs(header_secs + payload_secs);
        Transmission {
            id,
            sender,
            power_dbm,
            packet,
            mcs_header,
            mcs_payload,
            start,
            header_duration,
            duration,
            stop: start + duration,
        }
    }

    /// Time the header is complete.
    pub fn header_stop(&self) -> SimTime {
        self.start + self.header_duration
    }

    /// Whether the transmission is on the air at `time`.
    pub fn is_active_at(&self, time: SimTime) -> bool {
        self.start <= time && time <= self.stop
    }

    /// Frame size in bits.
    pub fn bit_size(&self) -> usize {
        self.packet.bit_size()
    }
}

impl fmt::Display for Transmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transmission(id: {}, from: {}, power: {} dBm, duration: {})",
            self.id, self.sender, self.power_dbm, self.duration
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimContext;
    use ncsim_packet::{Header, Payload};

    #[test]
    fn test_code_rate_reduced() {
        let rate = CodeRate::new(2, 4).unwrap();
        assert_eq!((rate.k(), rate.n()), (1, 2));
        assert!(CodeRate::new(0, 3).is_none());
        assert!(CodeRate::new(5, 3).is_none());
    }

    #[test]
    fn test_max_correctable_ber() {
        let ber = |k, n| Mcs::bpsk(CodeRate::new(k, n).unwrap(), DEFAULT_BIT_RATE).max_correctable_ber();
        assert_eq!(ber(1, 2), 1.0);
        assert_eq!(ber(4, 7), 0.5);
        assert!((ber(99, 100) - 1.0 / 99.0).abs() < 1e-12);
        // memoized value is stable
        assert_eq!(ber(4, 7), 0.5);
    }

    #[test]
    fn test_q_function() {
        assert!((q_function(0.0) - 0.5).abs() < 1e-6);
        assert!((q_function(1.0) - 0.158_655).abs() < 1e-5);
        // asymptotic branch
        let q4 = q_function(4.0);
        assert!(q4 > 3.0e-5 && q4 < 3.5e-5);
        assert!(q_function(2.9) > q_function(3.1));
    }

    #[test]
    fn test_bit_error_rate_falls_with_snr() {
        let mcs = Mcs::default();
        let weak = mcs.bit_error_rate(-90.0, -100.0, 100e3);
        let strong = mcs.bit_error_rate(-20.0, -100.0, 100e3);
        assert!(weak > strong);
        assert!(strong < 1e-9);
        assert!(weak <= 0.5);
    }

    #[test]
    fn test_unit_conversions() {
        assert!((dbm_to_mw(0.0) - 1.0).abs() < 1e-12);
        assert!((mw_to_dbm(100.0) - 20.0).abs() < 1e-12);
        let noise_dbm = mw_to_dbm(thermal_noise_mw(22e6, DEFAULT_TEMPERATURE_C));
        assert!(noise_dbm > -101.0 && noise_dbm < -100.0);
    }

    #[test]
    fn test_transmission_timing() {
        let mut ctx = SimContext::new(0);
        let sender = Device::new(&mut ctx, "s", 0.0, 0.0);
        let packet = Packet::new(Header::Fake(10), Payload::Fake(40));
        let slow_header = Mcs::bpsk(CodeRate::default(), 8e3);
        let tx = Transmission::new(1, sender, 0.0, packet, slow_header, Mcs::default(), SimTime::from_micros(100));
        // 80 header bits at 8 kbit/s, 320 payload bits at 100 kbit/s
        assert_eq!(tx.header_duration.as_micros(), 10_000);
        assert_eq!(tx.duration.as_micros(), 13_200);
        assert_eq!(tx.stop.as_micros(), 13_300);
        assert_eq!(tx.header_stop().as_micros(), 10_100);
        assert!(tx.is_active_at(SimTime::from_micros(13_300)));
        assert!(!tx.is_active_at(SimTime::from_micros(13_301)));
    }
}
