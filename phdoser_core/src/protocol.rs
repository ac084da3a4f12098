//! Probe line protocol.
//!
//! `ProtocolEngine` is the pure half of the probe service: it owns the
//! command queue, the single in-flight command and the reading filter, and
//! turns framed lines into an ordered list of `ProbeEvent`s. Performing those
//! events (serial writes, alerts, persistence) is the caller's job.
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use phdoser_config::{PhRange, SlopeResult};

use crate::filter::{FilterParams, ReadingFilter, Verdict};
use crate::notify::StatusState;

/// Device name used for every probe status and condition.
pub const PROBE_DEVICE: &str = "ph_probe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Calibration,
    SlopeQuery,
    General,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub text: String,
    pub kind: CommandKind,
}

impl Command {
    pub fn new(text: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }

    pub fn general(text: impl Into<String>) -> Self {
        Self::new(text, CommandKind::General)
    }
}

/// Response codes from the probe datasheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok,
    Error,
    OverVoltage,
    UnderVoltage,
    Reset,
    Ready,
    Sleep,
    Wake,
}

impl ResponseCode {
    pub fn parse(line: &str) -> Option<Self> {
        Some(match line {
            "*OK" => Self::Ok,
            "*ER" => Self::Error,
            "*OV" => Self::OverVoltage,
            "*UV" => Self::UnderVoltage,
            "*RS" => Self::Reset,
            "*RE" => Self::Ready,
            "*SL" => Self::Sleep,
            "*WA" => Self::Wake,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "*OK",
            Self::Error => "*ER",
            Self::OverVoltage => "*OV",
            Self::UnderVoltage => "*UV",
            Self::Reset => "*RS",
            Self::Ready => "*RE",
            Self::Sleep => "*SL",
            Self::Wake => "*WA",
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineClass {
    Response(ResponseCode),
    /// `?SLOPE,...` line; `Err` carries the reason the payload was rejected.
    Slope(Result<SlopeResult, String>),
    Reading(f64),
    Unknown,
}

const SLOPE_PREFIX: &str = "?SLOPE,";

pub fn classify(line: &str) -> LineClass {
    if let Some(code) = ResponseCode::parse(line) {
        return LineClass::Response(code);
    }
    if line.len() >= SLOPE_PREFIX.len()
        && line.is_char_boundary(SLOPE_PREFIX.len())
        && line[..SLOPE_PREFIX.len()].eq_ignore_ascii_case(SLOPE_PREFIX)
    {
        return LineClass::Slope(parse_slope(&line[SLOPE_PREFIX.len()..]));
    }
    if is_ph_literal(line) {
        if let Ok(v) = line.parse::<f64>() {
            return LineClass::Reading(round3(v));
        }
    }
    LineClass::Unknown
}

fn parse_slope(payload: &str) -> Result<SlopeResult, String> {
    let mut parts = payload.split(',').map(str::trim);
    let mut next = |name: &str| -> Result<f64, String> {
        let raw = parts.next().ok_or_else(|| format!("missing {name}"))?;
        raw.parse::<f64>()
            .map_err(|e| format!("bad {name} '{raw}': {e}"))
    };
    Ok(SlopeResult {
        acid_slope: next("acid slope")?,
        base_slope: next("base slope")?,
        offset: next("offset")?,
    })
}

/// Integer part 0..=14, optional fraction of one to three digits, and a value
/// no greater than 14.
pub fn is_ph_literal(s: &str) -> bool {
    let (int, frac) = match s.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (s, None),
    };
    let int_ok = match int.as_bytes() {
        [d] => d.is_ascii_digit(),
        [b'1', d] => (b'0'..=b'4').contains(d),
        _ => false,
    };
    if !int_ok {
        return false;
    }
    if let Some(f) = frac {
        if f.is_empty() || f.len() > 3 || !f.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        if int == "14" && f.bytes().any(|b| b != b'0') {
            return false;
        }
    }
    true
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Side effects requested by the engine, in the order they must happen.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeEvent {
    /// Write this command to the probe (the caller appends `\r`).
    Send(String),
    Condition {
        key: &'static str,
        message: String,
    },
    Status {
        key: &'static str,
        state: StatusState,
        message: String,
    },
    SlopeReceived(SlopeResult),
    ReadingAccepted(f64),
}

#[derive(Debug, Default)]
pub struct ProtocolEngine {
    queue: VecDeque<Command>,
    in_flight: Option<Command>,
    last_sent: Option<String>,
    filter: ReadingFilter,
}

impl ProtocolEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, cmd: Command) {
        tracing::debug!(target: "phdoser::probe", command = %cmd.text, kind = ?cmd.kind, "command enqueued");
        self.queue.push_back(cmd);
    }

    pub fn in_flight(&self) -> Option<&Command> {
        self.in_flight.as_ref()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn last_sent(&self) -> Option<&str> {
        self.last_sent.as_deref()
    }

    pub fn filter(&self) -> &ReadingFilter {
        &self.filter
    }

    /// Register a command written outside the queue (the `C,1` sent on
    /// connect) so its acknowledgement is matched to it.
    pub fn mark_sent(&mut self, cmd: Command) {
        self.last_sent = Some(cmd.text.clone());
        self.in_flight = Some(cmd);
    }

    /// Forget stream-derived state after a reconnect. Queued commands survive.
    pub fn reset_stream(&mut self) {
        self.in_flight = None;
        self.filter.reset();
    }

    /// Send the next queued command if nothing is awaiting a response.
    pub fn pump_queue(&mut self, out: &mut Vec<ProbeEvent>) {
        if self.in_flight.is_some() {
            return;
        }
        if let Some(cmd) = self.queue.pop_front() {
            out.push(ProbeEvent::Send(cmd.text.clone()));
            self.mark_sent(cmd);
        }
    }

    pub fn process<S: AsRef<str>>(
        &mut self,
        lines: &[S],
        params: &FilterParams,
        range: PhRange,
        now: Instant,
    ) -> Vec<ProbeEvent> {
        let mut out = Vec::new();
        self.pump_queue(&mut out);
        for line in lines {
            self.process_line(line.as_ref(), params, range, now, &mut out);
        }
        out
    }

    fn process_line(
        &mut self,
        line: &str,
        params: &FilterParams,
        range: PhRange,
        now: Instant,
        out: &mut Vec<ProbeEvent>,
    ) {
        match classify(line) {
            LineClass::Response(code) => {
                match self.in_flight.take() {
                    Some(cmd) => {
                        tracing::debug!(target: "phdoser::probe", %code, command = %cmd.text, "response");
                        match code {
                            ResponseCode::Error => out.push(ProbeEvent::Condition {
                                key: "command_error",
                                message: format!("Error response for command '{}'", cmd.text),
                            }),
                            ResponseCode::OverVoltage | ResponseCode::UnderVoltage => {
                                out.push(ProbeEvent::Condition {
                                    key: "voltage_issue",
                                    message: format!("Voltage error: {code}"),
                                });
                            }
                            _ => {}
                        }
                    }
                    None => {
                        tracing::debug!(target: "phdoser::probe", %code, "unexpected response (no command in progress)");
                    }
                }
                self.pump_queue(out);
            }
            LineClass::Slope(Ok(slope)) => {
                tracing::debug!(target: "phdoser::probe", ?slope, "slope received");
                out.push(ProbeEvent::SlopeReceived(slope));
                self.in_flight = None;
                self.pump_queue(out);
            }
            LineClass::Slope(Err(reason)) => {
                tracing::warn!(target: "phdoser::probe", line, %reason, "malformed slope line dropped");
                self.in_flight = None;
                self.pump_queue(out);
            }
            LineClass::Reading(ph) => self.process_reading(ph, params, range, now, out),
            LineClass::Unknown => {
                tracing::debug!(target: "phdoser::probe", line, "ignoring unrecognised line");
            }
        }
    }

    fn process_reading(
        &mut self,
        ph: f64,
        params: &FilterParams,
        range: PhRange,
        now: Instant,
        out: &mut Vec<ProbeEvent>,
    ) {
        out.push(ProbeEvent::Status {
            key: "reading",
            state: StatusState::Ok,
            message: "Receiving readings.".into(),
        });
        match self.filter.observe(ph, params, range, now) {
            Verdict::Unrealistic(v) => out.push(ProbeEvent::Condition {
                key: "unrealistic_reading",
                message: format!("Unrealistic pH: {v}"),
            }),
            Verdict::Jump {
                recent_jumps,
                alert: true,
                ..
            } => out.push(ProbeEvent::Condition {
                key: "persistent_unstable_readings",
                message: format!(
                    "{recent_jumps} big jumps (> {}) in last 60s.",
                    params.jump_threshold
                ),
            }),
            Verdict::Accepted { ph, range: check } => {
                out.push(ProbeEvent::ReadingAccepted(ph));
                if let Some(rc) = check {
                    let (state, message) = if rc.in_range {
                        (
                            StatusState::Ok,
                            format!(
                                "Average pH {:.2} is within recommended range [{}, {}].",
                                rc.average, range.min, range.max
                            ),
                        )
                    } else {
                        (
                            StatusState::Error,
                            format!(
                                "Average pH {:.2} over last {} readings is outside recommended range [{}, {}].",
                                rc.average,
                                crate::filter::ROLLING_WINDOW,
                                range.min,
                                range.max
                            ),
                        )
                    };
                    out.push(ProbeEvent::Status {
                        key: "out_of_range",
                        state,
                        message,
                    });
                }
            }
            Verdict::BelowFloor(_)
            | Verdict::Holding { .. }
            | Verdict::Unstable { .. }
            | Verdict::Jump { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("7", true)]
    #[case("7.123", true)]
    #[case("14", true)]
    #[case("14.000", true)]
    #[case("0.0", true)]
    #[case("7.1234", false)]
    #[case("14.5", false)]
    #[case("15", false)]
    #[case("07.1", false)]
    #[case(".5", false)]
    #[case("7.", false)]
    #[case("-1", false)]
    #[case("7.2e1", false)]
    fn ph_grammar(#[case] s: &str, #[case] ok: bool) {
        assert_eq!(is_ph_literal(s), ok, "{s}");
    }

    #[test]
    fn slope_prefix_is_case_insensitive() {
        let want = SlopeResult {
            acid_slope: 98.0,
            base_slope: 97.5,
            offset: -4.2,
        };
        assert_eq!(classify("?SLOPE,98.0,97.5,-4.2"), LineClass::Slope(Ok(want)));
        assert_eq!(classify("?Slope,98.0,97.5,-4.2"), LineClass::Slope(Ok(want)));
        assert!(matches!(classify("?Slope,98.0,abc"), LineClass::Slope(Err(_))));
    }

    #[test]
    fn reading_is_rounded_to_three_places() {
        assert_eq!(classify("7.125"), LineClass::Reading(7.125));
        assert_eq!(classify("*WA"), LineClass::Response(ResponseCode::Wake));
        assert_eq!(classify("hello"), LineClass::Unknown);
    }

    #[test]
    fn values_past_fourteen_are_noise_not_readings() {
        let mut e = ProtocolEngine::new();
        let p = FilterParams::default();
        let r = PhRange::default();
        assert_eq!(classify("14.5"), LineClass::Unknown);
        assert!(e.process(&["14.5", "99"], &p, r, Instant::now()).is_empty());

        let ev = e.process(&["14.000"], &p, r, Instant::now());
        assert!(ev.contains(&ProbeEvent::Condition {
            key: "unrealistic_reading",
            message: "Unrealistic pH: 14".into()
        }));
    }

    #[test]
    fn one_command_in_flight_at_a_time() {
        let mut e = ProtocolEngine::new();
        e.enqueue(Command::general("C,0"));
        e.enqueue(Command::new("Slope,?", CommandKind::SlopeQuery));
        let p = FilterParams::default();
        let r = PhRange::default();
        let now = Instant::now();

        let ev = e.process::<&str>(&[], &p, r, now);
        assert_eq!(ev, vec![ProbeEvent::Send("C,0".into())]);
        assert_eq!(e.in_flight().map(|c| c.text.as_str()), Some("C,0"));

        // Nothing new goes out until the response arrives.
        assert!(e.process::<&str>(&[], &p, r, now).is_empty());

        let ev = e.process(&["*OK"], &p, r, now);
        assert_eq!(ev, vec![ProbeEvent::Send("Slope,?".into())]);
        assert_eq!(e.last_sent(), Some("Slope,?"));
    }

    #[test]
    fn error_codes_raise_conditions() {
        let mut e = ProtocolEngine::new();
        e.mark_sent(Command::general("Cal,mid,7.00"));
        let ev = e.process(&["*ER"], &FilterParams::default(), PhRange::default(), Instant::now());
        assert_eq!(
            ev,
            vec![ProbeEvent::Condition {
                key: "command_error",
                message: "Error response for command 'Cal,mid,7.00'".into()
            }]
        );
        assert!(e.in_flight().is_none());
    }

    #[test]
    fn unexpected_response_is_harmless() {
        let mut e = ProtocolEngine::new();
        let ev = e.process(&["*OV"], &FilterParams::default(), PhRange::default(), Instant::now());
        assert!(ev.is_empty());
    }

    #[test]
    fn malformed_slope_clears_in_flight_and_advances() {
        let mut e = ProtocolEngine::new();
        e.mark_sent(Command::new("Slope,?", CommandKind::SlopeQuery));
        e.enqueue(Command::general("C,1"));
        let ev = e.process(
            &["?Slope,oops"],
            &FilterParams::default(),
            PhRange::default(),
            Instant::now(),
        );
        assert_eq!(ev, vec![ProbeEvent::Send("C,1".into())]);
    }
}
