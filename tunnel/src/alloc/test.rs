// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use hal::sim::SimHal;
use hal::{TE_DATA, TeHal, WriteMode};
use pretty_assertions::assert_eq;
use tracing_test::traced_test;

use super::*;

/// Records the moves instead of re-pointing anything
#[derive(Default)]
struct Recorder {
    moves: Vec<(u32, u32)>,
}

impl Relocate for Recorder {
    fn relocate(
        &mut self,
        _hal: &mut dyn TeHal,
        ctrl: &BlockCtrl,
        to: u32,
    ) -> Result<(), TunnelError> {
        self.moves.push((ctrl.start, to));
        Ok(())
    }
}

fn bin(entry: u32) -> BlockCtrl {
    BlockCtrl::new(1, BlockKind::RuleBin, entry)
}

fn table(size: u32, swap: u32, headroom: u32) -> (TeDataTable, SimHal) {
    (
        TeDataTable::new(0, size, swap, headroom).unwrap(),
        SimHal::new(1, size, 16, 4),
    )
}

/// Reserve a block and write a recognizable image in it
fn place(table: &mut TeDataTable, hal: &mut SimHal, start: u32, len: u32) {
    table.reserve(start, len, bin(start)).unwrap();
    let image: Vec<u32> = (0..len * 2).map(|w| (start << 8) | w).collect();
    hal.write_block(&TE_DATA, start, 0, &image, WriteMode::Posted)
        .unwrap();
}

#[test]
fn reserve_and_free() {
    let (mut table, _) = table(32, 4, 2);
    assert_eq!(table.swap_base(), 28);
    assert_eq!(table.capacity(), 27);
    assert_eq!(table.free_count(), 27);

    let handle = table.reserve(1, 3, bin(7)).unwrap();
    assert_eq!(table.first_free(), 4);
    assert_eq!(table.free_count(), 24);
    table.reserve(10, 2, bin(8)).unwrap();
    assert_eq!(table.first_free(), 4);
    assert_eq!(table.ctrl_at(2).map(|c| c.entry), Some(7));
    assert_eq!(table.handler[3], handle);

    assert!(matches!(
        table.reserve(2, 1, bin(9)),
        Err(TunnelError::Internal(_))
    ));
    assert!(matches!(
        table.reserve(0, 1, bin(9)),
        Err(TunnelError::Internal(_))
    ));
    assert!(matches!(table.free(2, 1), Err(TunnelError::Internal(_))));
    assert!(matches!(table.free(5, 1), Err(TunnelError::Internal(_))));
    assert!(matches!(table.free(1, 2), Err(TunnelError::Internal(_))));

    let ctrl = table.free(1, 3).unwrap();
    assert_eq!(ctrl.entry, 7);
    assert_eq!(table.first_free(), 1);
    assert_eq!(table.free_count(), 25);
    assert!(matches!(table.free(1, 3), Err(TunnelError::Internal(_))));
    assert_eq!(table.used_by_group(1), 2);
    table.validate().unwrap();
}

#[test]
fn hint_skips_consumed_runs() {
    let (mut table, _) = table(32, 4, 2);
    table.reserve(2, 2, bin(0)).unwrap();
    assert_eq!(table.first_free(), 1);
    table.reserve(1, 1, bin(1)).unwrap();
    assert_eq!(table.first_free(), 4);
    assert_eq!(table.scan(3), Some(4));
    table.validate().unwrap();
}

#[test]
fn dump_format() {
    let (mut table, _) = table(32, 4, 2);
    table
        .reserve(1, 3, BlockCtrl::new(7, BlockKind::RuleBin, 5))
        .unwrap();
    table
        .reserve(4, 1, BlockCtrl::new(7, BlockKind::SharedEncapFlow, 2))
        .unwrap();
    let dump = table.to_string();
    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(
        lines,
        vec![
            "TE-Data engine 0: 32 slots, 23 free, first free 5, swap 28+4",
            "1-3: 1 3 7 bin 5",
            "4-4: 2 1 7 flow 2",
            "5-31: free",
        ]
    );
}

#[traced_test]
#[test]
fn holes_are_filled_from_the_tail_inward() {
    let (mut table, mut hal) = table(32, 4, 0);
    place(&mut table, &mut hal, 1, 2);
    place(&mut table, &mut hal, 3, 3);
    place(&mut table, &mut hal, 6, 1);
    place(&mut table, &mut hal, 7, 2);
    place(&mut table, &mut hal, 9, 1);
    place(&mut table, &mut hal, 10, 17);
    table.free(1, 2).unwrap();
    table.free(6, 1).unwrap();
    assert_eq!(table.scan(3), None);

    let image_of_9: Vec<u32> = hal.engine(0).unwrap().slots(9, 1).to_vec();
    let mut recorder = Recorder::default();
    let mut ctx = MoveCtx {
        hal: &mut hal,
        relocator: &mut recorder,
    };
    assert_eq!(table.find(3, &mut ctx), Ok(7));
    assert_eq!(recorder.moves, vec![(9, 1), (3, 28), (28, 2), (7, 5)]);
    assert!(!table.swap_in_use());
    assert_eq!(hal.engine(0).unwrap().slots(1, 1), image_of_9.as_slice());
    assert_eq!(table.block_at(2).unwrap().entry, 3);
    table.validate().unwrap();
}

#[traced_test]
#[test]
fn repack_grows_the_swap_for_large_blocks() {
    let (mut table, mut hal) = table(64, 4, 0);
    place(&mut table, &mut hal, 2, 6);
    place(&mut table, &mut hal, 8, 2);
    assert_eq!(table.free_count(), 51);

    let mut recorder = Recorder::default();
    let mut ctx = MoveCtx {
        hal: &mut hal,
        relocator: &mut recorder,
    };
    assert_eq!(table.find(51, &mut ctx), Err(TunnelError::FlowFull));
    assert_eq!(table.swap_size(), 6);
    assert_eq!(table.largest_block(), 6);
    assert_eq!(table.block_at(1).unwrap().entry, 2);
    assert_eq!(table.block_at(7).unwrap().entry, 8);
    assert_eq!(table.free_count(), 49);
    assert_eq!(table.find(49, &mut ctx), Ok(9));
    table.validate().unwrap();
}

#[test]
fn swap_grows_and_shrinks() {
    let (mut table, mut hal) = table(32, 4, 0);
    place(&mut table, &mut hal, 26, 2);
    assert_eq!(table.free_count(), 25);

    let mut recorder = Recorder::default();
    let mut ctx = MoveCtx {
        hal: &mut hal,
        relocator: &mut recorder,
    };
    assert_eq!(table.grow_swap(8, &mut ctx), Ok(true));
    assert_eq!(recorder.moves, vec![(26, 1)]);
    assert_eq!(table.swap_base(), 24);
    assert_eq!(table.free_count(), 21);
    table.validate().unwrap();

    // a busy swap region cannot grow
    let mut ctx = MoveCtx {
        hal: &mut hal,
        relocator: &mut recorder,
    };
    table.move_block(1, 24, &mut ctx).unwrap();
    assert!(table.swap_in_use());
    assert_eq!(table.grow_swap(10, &mut ctx), Ok(false));
    table.shrink_swap(4);
    assert_eq!(table.swap_size(), 8);
    table.move_block(24, 1, &mut ctx).unwrap();

    table.shrink_swap(2);
    assert_eq!(table.swap_size(), 4);
    assert_eq!(table.free_count(), 25);
    table.validate().unwrap();
}

#[test]
fn find_respects_headroom() {
    let (mut table, mut hal) = table(16, 4, 2);
    place(&mut table, &mut hal, 1, 8);
    assert_eq!(table.free_count(), 3);
    let mut recorder = Recorder::default();
    let mut ctx = MoveCtx {
        hal: &mut hal,
        relocator: &mut recorder,
    };
    assert_eq!(table.find(2, &mut ctx), Err(TunnelError::FlowFull));
    assert_eq!(table.find(1, &mut ctx), Ok(9));
    assert_eq!(
        table.find(0, &mut ctx),
        Err(TunnelError::InvalidArgument("empty TE-Data block"))
    );
}

#[test]
fn reserve_find_free_round_trip() {
    bolero::check!()
        .with_type::<Vec<(u8, bool)>>()
        .for_each(|ops: &Vec<(u8, bool)>| {
            let (mut table, mut hal) = table(128, 4, 2);
            let mut recorder = Recorder::default();
            for (n, keep) in ops {
                let len = u32::from(*n % 8) + 1;
                let mut ctx = MoveCtx {
                    hal: &mut hal,
                    relocator: &mut recorder,
                };
                let Ok(start) = table.find(len, &mut ctx) else {
                    assert!(table.free_count() < len + table.headroom() || table.scan(len).is_none());
                    continue;
                };
                let before = (table.free_count(), table.first_free());
                table.reserve(start, len, bin(start)).unwrap();
                if !*keep {
                    table.free(start, len).unwrap();
                    assert_eq!((table.free_count(), table.first_free()), before);
                }
                table.validate().unwrap();
            }
        });
}
