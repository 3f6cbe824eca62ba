//! This provides a higher-level interface than the `Cable` trait.  Specifically, it keeps track of
//! the state of the JTAG state machine, and allows setting the state to any desired state.
//! `JtagSM` will get to that state by the most efficient path, based on the current state.
//!
//! MPSSE commands are collected in a buffer and only sent when a response is needed, when the
//! buffer fills, or on an explicit `flush`, so TMS moves and data shifts reach the adapter in the
//! order they were queued.
use ftdi_mpsse::{ClockTMSOut, MpsseCmdBuilder};
use log::trace;

use crate::cable::Cable;
use crate::error::Result;

/// Size of the adapter's command buffer.  Queued commands are sent once they would exceed it.
pub const BUFFER_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    Data,
    Instruction
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TapState {
    Reset = 0,
    Idle = 1,
    SelectDR = 2,
    CaptureDR = 3,
    ShiftDR = 4,
    Exit1DR = 5,
    PauseDR = 6,
    Exit2DR = 7,
    UpdateDR = 8,
    SelectIR = 9,
    CaptureIR = 10,
    ShiftIR = 11,
    Exit1IR = 12,
    PauseIR = 13,
    Exit2IR = 14,
    UpdateIR = 15,
}

use TapState::*;

/// Successor for (TMS=0, TMS=1), indexed by state.
const TRANSITIONS: [(TapState, TapState); 16] = [
    (Idle, Reset),
    (Idle, SelectDR),
    (CaptureDR, SelectIR),
    (ShiftDR, Exit1DR),
    (ShiftDR, Exit1DR),
    (PauseDR, UpdateDR),
    (PauseDR, Exit2DR),
    (ShiftDR, UpdateDR),
    (Idle, SelectDR),
    (CaptureIR, Reset),
    (ShiftIR, Exit1IR),
    (ShiftIR, Exit1IR),
    (PauseIR, UpdateIR),
    (PauseIR, Exit2IR),
    (ShiftIR, UpdateIR),
    (Idle, SelectDR),
];

/// For each current state, one bit per target state: the TMS value that takes the first step of
/// the shortest path toward that target.
pub const NEXT_HOP: [u16; 16] = build_next_hop();

const UNREACHABLE: u8 = u8::MAX;

const fn min(a: u8, b: u8) -> u8 {
    if a < b { a } else { b }
}

const fn build_next_hop() -> [u16; 16] {
    let mut dist = [[UNREACHABLE; 16]; 16];
    let mut s = 0;
    while s < 16 {
        dist[s][s] = 0;
        s += 1;
    }

    let mut changed = true;
    while changed {
        changed = false;
        let mut s = 0;
        while s < 16 {
            let (zero, one) = TRANSITIONS[s];
            let mut t = 0;
            while t < 16 {
                let via = min(dist[zero as usize][t], dist[one as usize][t]);
                if via != UNREACHABLE && via + 1 < dist[s][t] {
                    dist[s][t] = via + 1;
                    changed = true;
                }
                t += 1;
            }
            s += 1;
        }
    }

    let mut map = [0u16; 16];
    let mut s = 0;
    while s < 16 {
        let (zero, one) = TRANSITIONS[s];
        let mut t = 0;
        while t < 16 {
            let tms = if s == t {
                one as usize == s
            } else {
                dist[one as usize][t] < dist[zero as usize][t]
            };
            if tms {
                map[s] |= 1 << t;
            }
            t += 1;
        }
        s += 1;
    }
    map
}

impl TapState {
    pub const ALL: [TapState; 16] = [
        Reset, Idle,
        SelectDR, CaptureDR, ShiftDR, Exit1DR, PauseDR, Exit2DR, UpdateDR,
        SelectIR, CaptureIR, ShiftIR, Exit1IR, PauseIR, Exit2IR, UpdateIR,
    ];

    /// The state reached from this one after a single TCK with the given TMS level.
    pub const fn next(self, tms: bool) -> TapState {
        let (zero, one) = TRANSITIONS[self as usize];
        if tms { one } else { zero }
    }

    /// TMS level for the first step from this state toward `target`.
    pub const fn next_tms(self, target: TapState) -> bool {
        (NEXT_HOP[self as usize] >> target as usize) & 1 != 0
    }

    pub fn is_shift(self) -> bool {
        self == ShiftDR || self == ShiftIR
    }
}

/// Bookkeeping for the TAP controller.  Nothing here touches the wire; every `advance` must match
/// a TMS bit that was (or is about to be) clocked out.
#[derive(Clone, Debug)]
pub struct TapStateMachine {
    state: TapState,
}

impl Default for TapStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TapStateMachine {
    pub fn new() -> Self {
        Self { state: Reset }
    }

    pub fn current_state(&self) -> TapState {
        self.state
    }

    pub fn set_state(&mut self, state: TapState) {
        self.state = state;
    }

    pub fn advance(&mut self, tms: bool) -> TapState {
        self.state = self.state.next(tms);
        self.state
    }

    /// TMS sequence that walks from the current state to `target`.  Test-Logic-Reset is always
    /// five ones, whatever the current state.
    pub fn path_to(&self, target: TapState) -> Vec<bool> {
        if target == Reset {
            return vec![true; 5];
        }
        let mut path = Vec::new();
        let mut state = self.state;
        while state != target {
            let tms = state.next_tms(target);
            path.push(tms);
            state = state.next(tms);
        }
        path
    }
}

pub struct JtagSM<T> {
    pub cable: T,
    pub(crate) tap: TapStateMachine,
    pub(crate) buffer: Vec<u8>,
}

impl<T, U> JtagSM<T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    /// Create a JTAG state machine using an existing `Cable`.  The TAP is forced into
    /// Test-Logic-Reset.
    pub fn new(cable: T) -> Result<Self> {
        let mut jtag = Self {
            cable,
            tap: TapStateMachine::new(),
            buffer: Vec::with_capacity(BUFFER_SIZE),
        };
        jtag.mode_reset()?;
        jtag.flush()?;
        Ok(jtag)
    }

    pub fn state(&self) -> TapState {
        self.tap.current_state()
    }

    /// Overwrite the tracked state without clocking anything.
    pub fn set_state(&mut self, state: TapState) {
        self.tap.set_state(state);
    }

    /// Reset the scan chain by driving TMS high for 5 clocks
    pub fn mode_reset(&mut self) -> Result<()> {
        self.go_to_state(Reset)
    }

    /// Use TMS to get into `target` by the most efficient path
    pub fn go_to_state(&mut self, target: TapState) -> Result<()> {
        let path = self.tap.path_to(target);
        for &tms in &path {
            self.tap.advance(tms);
        }
        self.queue_tms(&path)
    }

    /// Queue TMS transitions with TDI held high.  The tracked state must already account for
    /// them.
    pub(crate) fn queue_tms(&mut self, tms: &[bool]) -> Result<()> {
        let mut builder = MpsseCmdBuilder::new();
        for group in tms.chunks(7) {
            let mut bits = 0;
            for (i, &b) in group.iter().enumerate() {
                if b {
                    bits |= 1 << i;
                }
            }
            builder = builder.clock_tms_out(ClockTMSOut::NegEdge, bits, true, group.len() as u8);
        }
        self.queue(builder.as_slice())
    }

    /// Append raw MPSSE commands, sending what is already buffered first if they would not fit.
    pub(crate) fn queue(&mut self, cmd: &[u8]) -> Result<()> {
        if self.buffer.len() + cmd.len() > BUFFER_SIZE {
            self.flush()?;
        }
        self.buffer.extend_from_slice(cmd);
        if self.buffer.len() >= BUFFER_SIZE {
            self.flush()?;
        }
        Ok(())
    }

    /// Send every queued command to the adapter.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        trace!("mpsse: sending {} bytes", self.buffer.len());
        let res = self.cable.write_bytes(&self.buffer);
        self.buffer.clear();
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::TapState::*;
    use crate::cable::sim::SimCable;
    use std::collections::VecDeque;

    fn distance(from: TapState, to: TapState) -> usize {
        let mut seen = [false; 16];
        let mut queue = VecDeque::new();
        queue.push_back((from, 0));
        seen[from as usize] = true;
        while let Some((s, d)) = queue.pop_front() {
            if s == to {
                return d;
            }
            for tms in [false, true] {
                let n = s.next(tms);
                if !seen[n as usize] {
                    seen[n as usize] = true;
                    queue.push_back((n, d + 1));
                }
            }
        }
        panic!("unreachable");
    }

    #[test]
    fn transition_table() {
        assert_eq!(Reset.next(false), Idle);
        assert_eq!(Reset.next(true), Reset);
        assert_eq!(SelectDR.next(true), SelectIR);
        assert_eq!(SelectIR.next(true), Reset);
        assert_eq!(Exit2DR.next(false), ShiftDR);
        assert_eq!(UpdateIR.next(false), Idle);
        for (i, s) in TapState::ALL.iter().enumerate() {
            assert_eq!(*s as usize, i);
        }
    }

    #[test]
    fn next_hop_values() {
        assert_eq!(NEXT_HOP, [
            0x0001, 0xFFFD, 0xFE03, 0xFFE7, 0xFFEF, 0xFF0F, 0xFFBF, 0xFF0F,
            0xFEFD, 0x01FF, 0xF3FF, 0xF7FF, 0x87FF, 0xDFFF, 0x87FF, 0x7FFD,
        ]);
    }

    #[test]
    fn every_pair_reachable_by_shortest_path() {
        let mut longest = 0;
        for &from in &TapState::ALL {
            for &to in &TapState::ALL {
                let mut sm = TapStateMachine::new();
                sm.set_state(from);
                let path = sm.path_to(to);
                for &tms in &path {
                    sm.advance(tms);
                }
                assert_eq!(sm.current_state(), to);
                if to != Reset {
                    assert_eq!(path.len(), distance(from, to), "{:?} -> {:?}", from, to);
                }
                longest = longest.max(path.len());
            }
        }
        assert_eq!(longest, 8);
    }

    #[test]
    fn six_hops_except_far_side_states() {
        let far = [Exit2DR, PauseIR, Exit2IR, UpdateIR];
        for &from in &TapState::ALL {
            for &to in TapState::ALL.iter().filter(|s| !far.contains(s)) {
                let mut sm = TapStateMachine::new();
                sm.set_state(from);
                assert!(sm.path_to(to).len() <= 6, "{:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    fn reset_is_always_five_ones() {
        for &from in &TapState::ALL {
            let mut jtag = JtagSM::new(Box::new(SimCable::loopback())).unwrap();
            jtag.set_state(from);
            jtag.cable.clear_log();
            jtag.mode_reset().unwrap();
            jtag.flush().unwrap();
            assert_eq!(jtag.state(), Reset);
            assert_eq!(jtag.cable.tms_bits(), vec![true; 5]);
        }
    }

    #[test]
    fn new_resets() {
        let jtag = JtagSM::new(Box::new(SimCable::loopback())).unwrap();
        assert_eq!(jtag.state(), Reset);
        assert_eq!(jtag.cable.tms_bits(), vec![true; 5]);
    }

    #[test]
    fn already_there_is_a_noop() {
        let mut jtag = JtagSM::new(Box::new(SimCable::loopback())).unwrap();
        jtag.go_to_state(ShiftDR).unwrap();
        jtag.flush().unwrap();
        let writes = jtag.cable.writes();
        jtag.cable.clear_log();
        jtag.go_to_state(ShiftDR).unwrap();
        jtag.flush().unwrap();
        assert!(jtag.cable.clocks().is_empty());
        assert_eq!(jtag.cable.writes(), writes);
    }

    #[test]
    fn long_paths_are_split() {
        let mut jtag = JtagSM::new(Box::new(SimCable::loopback())).unwrap();
        jtag.go_to_state(ShiftDR).unwrap();
        jtag.cable.clear_log();
        jtag.go_to_state(Exit2IR).unwrap();
        jtag.flush().unwrap();
        assert_eq!(jtag.state(), Exit2IR);
        assert_eq!(jtag.cable.tms_bits().len(), 8);
        assert_eq!(jtag.cable.tap_state(), Exit2IR);
    }
}
