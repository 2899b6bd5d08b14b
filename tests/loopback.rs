//! End-to-end tests wiring a master and a slave engine back to back
//! through an in-memory half-duplex link, driving complete transactions
//! for every supported function code.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use modbus_rtu::{
    Clock, ExceptionCode, MasterConfig, MasterOutcome, MasterStack, MasterState, Response,
    Result, SerialLink, SlaveConfig, SlaveDevice, SlaveStack, SlaveState,
};

/// Captures whatever its owner transmits
#[derive(Clone, Default)]
struct BusTap {
    frames: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl BusTap {
    fn take(&self) -> Option<Vec<u8>> {
        self.frames.borrow_mut().pop()
    }

    fn is_silent(&self) -> bool {
        self.frames.borrow().is_empty()
    }
}

impl SerialLink for BusTap {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.frames.borrow_mut().push(frame.to_vec());
        Ok(())
    }

    fn arm_receive(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Manually advanced time source shared between the test and the master
#[derive(Clone, Default)]
struct ManualClock(Rc<Cell<u64>>);

impl ManualClock {
    fn advance(&self, ms: u64) {
        self.0.set(self.0.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.get()
    }
}

/// Map-backed register and packet store
#[derive(Default)]
struct Bench {
    registers: HashMap<u16, u16>,
    packet: Vec<u8>,
}

impl SlaveDevice for Bench {
    fn read_register(&mut self, address: u16) -> std::result::Result<u16, ExceptionCode> {
        Ok(self.registers.get(&address).copied().unwrap_or(0))
    }

    fn write_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> std::result::Result<(), ExceptionCode> {
        self.registers.insert(address, value);
        Ok(())
    }

    #[cfg(feature = "data-packets")]
    fn read_packet(&mut self, out: &mut [u8]) -> std::result::Result<usize, ExceptionCode> {
        out[..self.packet.len()].copy_from_slice(&self.packet);
        Ok(self.packet.len())
    }

    #[cfg(feature = "data-packets")]
    fn write_packet(&mut self, data: &[u8]) -> std::result::Result<(), ExceptionCode> {
        self.packet = data.to_vec();
        Ok(())
    }
}

struct TestBench {
    master: MasterStack<BusTap, ManualClock>,
    slave: SlaveStack<Bench, BusTap>,
    master_tap: BusTap,
    slave_tap: BusTap,
    clock: ManualClock,
}

fn bench(slave_address: u8, last_register: u16) -> TestBench {
    let master_tap = BusTap::default();
    let slave_tap = BusTap::default();
    let clock = ManualClock::default();

    let master = MasterStack::new(
        MasterConfig::default(),
        master_tap.clone(),
        clock.clone(),
    )
    .unwrap();
    let slave = SlaveStack::new(
        SlaveConfig {
            address: slave_address,
            last_register,
        },
        Bench::default(),
        slave_tap.clone(),
    )
    .unwrap();

    TestBench {
        master,
        slave,
        master_tap,
        slave_tap,
        clock,
    }
}

impl TestBench {
    /// Carry the issued request over the bus and the answer (if any) back,
    /// returning the master's terminal outcome
    fn pump(&mut self) -> MasterOutcome {
        let request = self.master_tap.take().expect("master put nothing on the bus");
        self.master.tx_done();

        self.slave.poll(); // arm
        assert_eq!(self.slave.state(), SlaveState::Receiving);
        self.slave.rx_done(&request);
        self.slave.poll(); // dispatch

        if let Some(answer) = self.slave_tap.take() {
            self.slave.tx_done();
            self.master.rx_done(&answer);
        } else {
            // No answer (broadcast or discard): the master runs out its clock
            self.clock.advance(101);
        }

        let outcome = self.master.poll().expect("transaction did not terminate");
        assert_eq!(self.master.state(), MasterState::Standby);
        assert!(self.master.poll().is_none(), "outcome reported twice");
        outcome
    }
}

#[test]
fn read_holding_registers_round_trip() {
    let mut b = bench(1, 0x00FF);
    b.slave.device_mut().registers.insert(0x0010, 0xAABB);
    b.slave.device_mut().registers.insert(0x0011, 0xCCDD);

    b.master.read_holding_registers(1, 0x0010, 2).unwrap();
    match b.pump() {
        MasterOutcome::Processed(Response::Registers(regs)) => {
            assert_eq!(regs.as_slice(), &[0xAABB, 0xCCDD]);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn read_input_registers_round_trip() {
    let mut b = bench(7, 0x00FF);
    b.slave.device_mut().registers.insert(0x0000, 0x0042);

    b.master.read_input_registers(7, 0x0000, 1).unwrap();
    match b.pump() {
        MasterOutcome::Processed(Response::Registers(regs)) => {
            assert_eq!(regs.as_slice(), &[0x0042]);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn write_registers_round_trip() {
    let mut b = bench(1, 0x00FF);

    b.master
        .write_registers(1, 0x0020, &[0x000A, 0x0102])
        .unwrap();
    match b.pump() {
        MasterOutcome::Processed(Response::WriteConfirmed { start, count }) => {
            assert_eq!((start, count), (0x0020, 2));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(b.slave.device().registers.get(&0x0020), Some(&0x000A));
    assert_eq!(b.slave.device().registers.get(&0x0021), Some(&0x0102));
}

#[test]
fn out_of_range_read_comes_back_as_exception() {
    let mut b = bench(1, 0x000F);

    b.master.read_holding_registers(1, 0x000E, 3).unwrap();
    match b.pump() {
        MasterOutcome::ExceptionReported(code) => {
            assert_eq!(code, ExceptionCode::IllegalDataAddress as u8);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn broadcast_write_applies_silently_and_master_times_out() {
    let mut b = bench(1, 0x00FF);

    b.master.write_registers(0, 0x0005, &[0x1234]).unwrap();
    let outcome = b.pump();

    // The slave acted on the broadcast but put nothing on the bus
    assert_eq!(b.slave.device().registers.get(&0x0005), Some(&0x1234));
    assert!(b.slave_tap.is_silent());
    assert!(matches!(outcome, MasterOutcome::TimedOut));
}

#[test]
fn request_for_another_station_is_ignored() {
    let mut b = bench(1, 0x00FF);

    b.master.read_holding_registers(9, 0x0000, 1).unwrap();
    let outcome = b.pump();

    assert!(b.slave_tap.is_silent());
    assert!(matches!(outcome, MasterOutcome::TimedOut));
}

#[test]
fn back_to_back_transactions_reuse_the_engines() {
    let mut b = bench(1, 0x00FF);

    for round in 0..5u16 {
        b.master
            .write_registers(1, round, &[round.wrapping_mul(3)])
            .unwrap();
        assert!(matches!(b.pump(), MasterOutcome::Processed(_)));

        b.master.read_holding_registers(1, round, 1).unwrap();
        match b.pump() {
            MasterOutcome::Processed(Response::Registers(regs)) => {
                assert_eq!(regs.as_slice(), &[round.wrapping_mul(3)]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    assert_eq!(b.master.stats().responses_processed, 10);
    assert_eq!(b.slave.stats().answers_sent, 10);
}

#[cfg(feature = "data-packets")]
#[test]
fn data_packet_round_trip() {
    let mut b = bench(1, 0x00FF);

    b.master.write_packet(1, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
    match b.pump() {
        MasterOutcome::Processed(Response::PacketWritten { len }) => assert_eq!(len, 4),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(b.slave.device().packet, vec![0xDE, 0xAD, 0xBE, 0xEF]);

    b.master.read_packet(1).unwrap();
    match b.pump() {
        MasterOutcome::Processed(Response::Packet(packet)) => {
            assert_eq!(packet.as_slice(), &[0xDE, 0xAD, 0xBE, 0xEF]);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

/// Arbitrary interleavings of ticks and driver events must never wedge or
/// panic either engine; after the dust settles both must be drivable again.
#[test]
fn randomized_event_interleaving_never_wedges_the_engines() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();

    let mut rng = StdRng::seed_from_u64(0x4D6F6462_7573);
    let mut b = bench(1, 0x00FF);

    for _ in 0..2000 {
        match rng.gen_range(0..10) {
            0 => {
                let _ = b.master.read_holding_registers(1, rng.gen_range(0..0x80), 1);
            }
            1 => {
                let _ = b.master.write_registers(1, rng.gen_range(0..0x80), &[rng.gen()]);
            }
            2 => b.master.tx_done(),
            3 => b.slave.tx_done(),
            4 => {
                let len = rng.gen_range(0..16);
                let junk: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                b.master.rx_done(&junk);
            }
            5 => {
                let len = rng.gen_range(0..16);
                let junk: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                b.slave.rx_done(&junk);
            }
            6 => b.master.rx_error(),
            7 => b.slave.rx_error(),
            8 => {
                b.clock.advance(rng.gen_range(0..150));
                let _ = b.master.poll();
            }
            _ => {
                let _ = b.slave.poll();
            }
        }
        // Drain stray traffic so the taps do not grow without bound
        let _ = b.master_tap.take();
        let _ = b.slave_tap.take();
    }

    // Force both engines back to idle and run one clean transaction
    loop {
        match b.master.state() {
            MasterState::Standby => break,
            MasterState::Transmitting => b.master.tx_done(),
            _ => {
                b.clock.advance(200);
                let _ = b.master.poll();
            }
        }
    }
    while b.slave.state() != SlaveState::Standby {
        match b.slave.state() {
            SlaveState::Transmitting => b.slave.tx_done(),
            SlaveState::Receiving => b.slave.rx_error(),
            _ => {
                let _ = b.slave.poll();
            }
        }
    }
    let _ = b.master_tap.take();
    let _ = b.slave_tap.take();

    b.slave.device_mut().registers.insert(0x0001, 0xBEEF);
    b.master.read_holding_registers(1, 0x0001, 1).unwrap();
    match b.pump() {
        MasterOutcome::Processed(Response::Registers(regs)) => {
            assert_eq!(regs.as_slice(), &[0xBEEF]);
        }
        other => panic!("engines did not recover: {:?}", other),
    }
}
