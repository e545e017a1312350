//! Scripted double of the SDHI hardware shim.
//!
//! Tests enqueue the exact command sequence they expect; the mock panics
//! on any command it was not told about, so a passing test pins the
//! whole protocol exchange. Interrupt completion is modelled as a queue
//! of latched-flag events drained by `int_wait`.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::VecDeque;

use sdhi::SdError;
use sdhi::sd::constant::*;
use sdhi::sd::{BusWidth, CdLayout, SdDev};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    PowerOn,
    PowerOff,
    SetClock { rate: u32, enable: bool },
    SetBusWidth(BusWidth),
    SetCdInt { enable: bool },
    IssueCmd { cmd: u16, arg: u32 },
    SetIntMask { info1: u64, info2: u64 },
    ClearIntMask { info1: u64, info2: u64 },
    SetTransferBytes(u32),
    SetSectorCount(Option<u32>),
    StopTransfer,
    ReadData(usize),
    WriteData(usize),
    EnableDma,
    WaitDmaEnd(usize),
    DisableDma,
}

enum Event {
    Ready(u64, u64),
    Timeout,
}

pub enum Outcome {
    Ok([u16; 8]),
    Err2(u64),
    NoWait,
}

pub enum DataPhase {
    None,
    /// One buffer-ready window per entry.
    ReadBlocks(Vec<Vec<u8>>),
    /// Like `ReadBlocks`, but the exchange dies after the last window:
    /// neither another buffer-ready nor the access end ever fires.
    ReadBlocksHang(Vec<Vec<u8>>),
    /// The buffer-ready wait never fires.
    ReadTimeout,
    /// Expect this many written windows, then finish per `WriteEnd`.
    Write(u32, WriteEnd),
    /// Command + data completion both queued at issue (DMA runs outside
    /// the interrupt flags).
    Dma,
}

pub enum WriteEnd {
    Done,
    Err2(u64),
    /// Data timeout at access end, then the busy line holds for N polls.
    Busy(u32),
    Timeout,
}

pub struct Step {
    pub cmd: u16,
    pub outcome: Outcome,
    pub data: DataPhase,
}

impl Step {
    pub fn ok(cmd: u16) -> Step {
        Step { cmd, outcome: Outcome::Ok([0; 8]), data: DataPhase::None }
    }

    pub fn resp(cmd: u16, resp: [u16; 8]) -> Step {
        Step { cmd, outcome: Outcome::Ok(resp), data: DataPhase::None }
    }

    pub fn err(cmd: u16, info2: u64) -> Step {
        Step { cmd, outcome: Outcome::Err2(info2), data: DataPhase::None }
    }

    pub fn nowait(cmd: u16) -> Step {
        Step { cmd, outcome: Outcome::NoWait, data: DataPhase::None }
    }

    pub fn read(cmd: u16, data: Vec<u8>) -> Step {
        Step {
            cmd,
            outcome: Outcome::Ok([0; 8]),
            data: DataPhase::ReadBlocks(vec![data]),
        }
    }

    pub fn read_blocks(cmd: u16, blocks: Vec<Vec<u8>>) -> Step {
        Step { cmd, outcome: Outcome::Ok([0; 8]), data: DataPhase::ReadBlocks(blocks) }
    }

    pub fn read_blocks_hang(cmd: u16, blocks: Vec<Vec<u8>>) -> Step {
        Step { cmd, outcome: Outcome::Ok([0; 8]), data: DataPhase::ReadBlocksHang(blocks) }
    }

    pub fn read_timeout(cmd: u16) -> Step {
        Step { cmd, outcome: Outcome::Ok([0; 8]), data: DataPhase::ReadTimeout }
    }

    pub fn write(cmd: u16, blocks: u32) -> Step {
        Step {
            cmd,
            outcome: Outcome::Ok([0; 8]),
            data: DataPhase::Write(blocks, WriteEnd::Done),
        }
    }

    pub fn write_busy(cmd: u16, polls: u32) -> Step {
        Step {
            cmd,
            outcome: Outcome::Ok([0; 8]),
            data: DataPhase::Write(1, WriteEnd::Busy(polls)),
        }
    }

    pub fn dma(cmd: u16) -> Step {
        Step { cmd, outcome: Outcome::Ok([0; 8]), data: DataPhase::Dma }
    }
}

pub struct MockDev {
    pub steps: VecDeque<Step>,
    pub log: Vec<Call>,
    events: VecDeque<Event>,
    info1: u64,
    info2: u64,
    resp: [u16; 8],
    read_q: VecDeque<Vec<u8>>,
    read_end: bool,
    write_left: u32,
    write_end: WriteEnd,
    pub written: Vec<Vec<u8>>,
    busy_polls: Cell<u32>,
    pub layout: Option<CdLayout>,
    pub level: bool,
    pub clock_on: bool,
    pub dma_result: Result<(), SdError>,
    pub mask1: u64,
    pub mask2: u64,
    step_no: usize,
}

impl MockDev {
    pub fn new(steps: Vec<Step>) -> Self {
        MockDev {
            steps: steps.into(),
            log: Vec::new(),
            events: VecDeque::new(),
            info1: 0,
            info2: 0,
            resp: [0; 8],
            read_q: VecDeque::new(),
            read_end: true,
            write_left: 0,
            write_end: WriteEnd::Done,
            written: Vec::new(),
            busy_polls: Cell::new(0),
            layout: Some(CdLayout::Cd),
            level: true,
            clock_on: false,
            dma_result: Ok(()),
            mask1: 0,
            mask2: 0,
            step_no: 0,
        }
    }

    pub fn cmds(&self) -> Vec<u16> {
        self.log
            .iter()
            .filter_map(|c| match c {
                Call::IssueCmd { cmd, .. } => Some(*cmd),
                _ => None,
            })
            .collect()
    }

    pub fn cmd_arg(&self, cmd: u16) -> Option<u32> {
        self.log.iter().find_map(|c| match c {
            Call::IssueCmd { cmd: c, arg } if *c == cmd => Some(*arg),
            _ => None,
        })
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.log.iter().filter(|c| pred(c)).count()
    }

    pub fn assert_script_done(&self) {
        assert!(
            self.steps.is_empty(),
            "{} scripted command(s) never issued",
            self.steps.len()
        );
    }

    pub fn busy_left(&self) -> u32 {
        self.busy_polls.get()
    }
}

impl SdDev for MockDev {
    fn power_on(&mut self, _port: u32) -> Result<(), SdError> {
        self.log.push(Call::PowerOn);
        Ok(())
    }

    fn power_off(&mut self, _port: u32) -> Result<(), SdError> {
        self.log.push(Call::PowerOff);
        Ok(())
    }

    fn set_clock(&mut self, _port: u32, rate: u32, enable: bool) -> Result<(), SdError> {
        self.log.push(Call::SetClock { rate, enable });
        self.clock_on = enable;
        Ok(())
    }

    fn set_bus_width(&mut self, _port: u32, width: BusWidth) -> Result<(), SdError> {
        self.log.push(Call::SetBusWidth(width));
        Ok(())
    }

    fn cd_layout(&self, _port: u32) -> Option<CdLayout> {
        self.layout
    }

    fn cd_level(&self, _port: u32, _layout: CdLayout) -> bool {
        self.level
    }

    fn set_cd_int(&mut self, _port: u32, _layout: CdLayout, enable: bool) {
        self.log.push(Call::SetCdInt { enable });
    }

    fn issue_cmd(&mut self, _port: u32, cmd: u16, arg_hi: u16, arg_lo: u16) {
        let arg = ((arg_hi as u32) << 16) | arg_lo as u32;
        self.log.push(Call::IssueCmd { cmd, arg });

        let step = self.steps.pop_front().unwrap_or_else(|| {
            panic!("unscripted command CMD{} (step {})", cmd & !SD_ACMD, self.step_no)
        });
        assert_eq!(
            step.cmd,
            cmd,
            "step {}: expected CMD{}, driver issued CMD{}",
            self.step_no,
            step.cmd & !SD_ACMD,
            cmd & !SD_ACMD
        );
        self.step_no += 1;

        match step.outcome {
            Outcome::Ok(resp) => {
                self.resp = resp;
                self.events.push_back(Event::Ready(INFO1_RESP_END, 0));
            }
            Outcome::Err2(bits) => {
                self.events.push_back(Event::Ready(INFO1_RESP_END, bits));
                return;
            }
            Outcome::NoWait => {
                self.events.push_back(Event::Timeout);
                return;
            }
        }

        match step.data {
            DataPhase::None => {}
            DataPhase::ReadBlocks(blocks) => {
                self.read_q = blocks.into();
                self.read_end = true;
                self.events.push_back(Event::Ready(0, INFO2_BRE));
            }
            DataPhase::ReadBlocksHang(blocks) => {
                self.read_q = blocks.into();
                self.read_end = false;
                self.events.push_back(Event::Ready(0, INFO2_BRE));
            }
            DataPhase::ReadTimeout => {
                self.events.push_back(Event::Timeout);
            }
            DataPhase::Write(blocks, end) => {
                self.write_left = blocks;
                self.write_end = end;
                self.events.push_back(Event::Ready(0, INFO2_BWE));
            }
            DataPhase::Dma => {
                self.events.push_back(Event::Ready(INFO1_ACCESS_END, 0));
            }
        }
    }

    fn response(&self, _port: u32) -> [u16; 8] {
        self.resp
    }

    fn card_busy(&self, _port: u32) -> bool {
        let left = self.busy_polls.get();
        if left > 0 {
            self.busy_polls.set(left - 1);
            true
        } else {
            false
        }
    }

    fn int_wait(&mut self, _port: u32, _timeout: u32) -> Result<(), SdError> {
        match self.events.pop_front() {
            Some(Event::Ready(i1, i2)) => {
                self.info1 |= i1;
                self.info2 |= i2;
                Ok(())
            }
            Some(Event::Timeout) | None => Err(SdError::HostTimeout),
        }
    }

    fn int_status(&self, _port: u32) -> (u64, u64) {
        (self.info1, self.info2)
    }

    fn set_int_mask(&mut self, _port: u32, info1: u64, info2: u64) {
        self.log.push(Call::SetIntMask { info1, info2 });
        self.mask1 |= info1;
        self.mask2 |= info2;
    }

    fn clear_int_mask(&mut self, _port: u32, info1: u64, info2: u64) {
        self.log.push(Call::ClearIntMask { info1, info2 });
        self.mask1 &= !info1;
        self.mask2 &= !info2;
    }

    fn clear_int(&mut self, _port: u32, info1: u64, info2: u64) {
        self.info1 &= !info1;
        self.info2 &= !info2;
    }

    fn set_transfer_bytes(&mut self, _port: u32, bytes: u32) {
        self.log.push(Call::SetTransferBytes(bytes));
    }

    fn set_sector_count(&mut self, _port: u32, count: Option<u32>) {
        self.log.push(Call::SetSectorCount(count));
    }

    fn stop_transfer(&mut self, _port: u32) {
        self.log.push(Call::StopTransfer);
    }

    fn read_data(&mut self, _port: u32, buf: &mut [u8]) -> Result<(), SdError> {
        self.log.push(Call::ReadData(buf.len()));
        let block = self.read_q.pop_front().expect("read_data with no scripted window");
        assert_eq!(block.len(), buf.len(), "read window size mismatch");
        buf.copy_from_slice(&block);
        if !self.read_q.is_empty() {
            self.events.push_back(Event::Ready(0, INFO2_BRE));
        } else if self.read_end {
            self.events.push_back(Event::Ready(INFO1_ACCESS_END, 0));
        }
        Ok(())
    }

    fn write_data(&mut self, _port: u32, buf: &[u8]) -> Result<(), SdError> {
        self.log.push(Call::WriteData(buf.len()));
        assert!(self.write_left > 0, "write_data with no scripted window");
        self.written.push(buf.to_vec());
        self.write_left -= 1;
        if self.write_left > 0 {
            self.events.push_back(Event::Ready(0, INFO2_BWE));
        } else {
            match self.write_end {
                WriteEnd::Done => self.events.push_back(Event::Ready(INFO1_ACCESS_END, 0)),
                WriteEnd::Err2(bits) => self.events.push_back(Event::Ready(0, bits)),
                WriteEnd::Busy(polls) => {
                    self.busy_polls.set(polls);
                    self.events.push_back(Event::Ready(0, INFO2_DATA_TIMEOUT));
                }
                WriteEnd::Timeout => self.events.push_back(Event::Timeout),
            }
        }
        Ok(())
    }

    fn enable_dma(&mut self, _port: u32) -> Result<(), SdError> {
        self.log.push(Call::EnableDma);
        Ok(())
    }

    fn wait_dma_end(&mut self, _port: u32, bytes: usize) -> Result<(), SdError> {
        self.log.push(Call::WaitDmaEnd(bytes));
        self.dma_result
    }

    fn disable_dma(&mut self, _port: u32) -> Result<(), SdError> {
        self.log.push(Call::DisableDma);
        Ok(())
    }
}

// ---- response and register builders ----

pub fn r1(status: u32) -> [u16; 8] {
    let mut r = [0u16; 8];
    r[0] = status as u16;
    r[1] = (status >> 16) as u16;
    r
}

pub fn r3(ocr: u32) -> [u16; 8] {
    r1(ocr)
}

pub fn r6(rca: u16) -> [u16; 8] {
    let mut r = [0u16; 8];
    r[1] = rca;
    r
}

/// R7 echoing the standard interface-condition argument.
pub fn r7_echo() -> [u16; 8] {
    let mut r = [0u16; 8];
    r[0] = 0x01aa;
    r
}

fn csd_set(csd: &mut [u16; 8], hi: u32, lo: u32, value: u32) {
    for i in 0..=(hi - lo) {
        let bit = lo + i;
        if value & (1 << i) != 0 {
            let idx = ((127 - bit) / 16) as usize;
            csd[idx] |= 1 << (bit % 16);
        }
    }
}

/// CSD v2 image: 25 MHz transfer rate, capacity `(c_size + 1) * 1024`
/// sectors, no DSR.
pub fn csd_v2(c_size: u32) -> [u16; 8] {
    let mut csd = [0u16; 8];
    csd_set(&mut csd, 127, 126, 1);
    csd_set(&mut csd, 103, 96, 0x32);
    csd_set(&mut csd, 69, 48, c_size);
    csd
}

/// CSD v1 image: 25 MHz transfer rate, 1024 sectors of 512 bytes.
pub fn csd_v1() -> [u16; 8] {
    let mut csd = [0u16; 8];
    csd_set(&mut csd, 103, 96, 0x32);
    csd_set(&mut csd, 73, 62, 255);
    csd_set(&mut csd, 49, 47, 0);
    csd_set(&mut csd, 83, 80, 9);
    csd
}

/// SCR bytes as read through ACMD51 (big-endian on the wire).
pub fn scr_bytes(sd_spec: u8, spec3: bool) -> Vec<u8> {
    let mut scr = vec![0u8; SCR_BYTES];
    scr[0] = sd_spec & 0x0f;
    if spec3 {
        scr[2] = 0x80;
    }
    scr
}

/// SD_STATUS bytes as read through ACMD13.
pub fn sd_status_bytes(au: u8, erase_size: u16, rom: bool) -> Vec<u8> {
    let mut stat = vec![0u8; SD_STATUS_BYTES];
    if rom {
        stat[3] = 0x01;
    }
    stat[8] = 0x02; // speed class 4
    stat[10] = au << 4; // AU_SIZE exponent, high nibble of half 5
    stat[11] = (erase_size >> 8) as u8;
    stat[12] = erase_size as u8;
    stat
}
