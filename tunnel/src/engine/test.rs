// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use hal::sim::{HalOp, SimHal};
use hal::{FlowCounter, LookupEntry, TE_DATA_WIDTH, TeHal};
use pretty_assertions::assert_eq;
use std::net::{IpAddr, Ipv4Addr};
use tracing_test::traced_test;

use super::TunnelState;
use crate::codec::{TeRecord, decode_block, flow_ptr_slot, from_words, to_words};
use crate::config::{TunnelConfig, TunnelConfigBuilder};
use crate::errors::{ErrorClass, TunnelError};
use crate::model::bin::BlockRef;
use crate::model::flow::{EncapField, EncapFlowParams, EncapValues, FlowPtr};
use crate::model::group::{TunnelGroupParams, TunnelGroupParamsBuilder};
use crate::model::rule::{ConditionParams, RuleAction, RuleActionParams, TunnelCondition};
use crate::types::{GroupId, LookupType};

fn config(te_data_size: u32) -> TunnelConfig {
    TunnelConfigBuilder::default()
        .engines(1)
        .te_data_size(te_data_size)
        .lookup_size(256)
        .counters(4)
        .max_groups(4)
        .groups_per_engine(2)
        .build()
        .unwrap()
}

fn state_with(config: TunnelConfig) -> TunnelState<SimHal> {
    let hal = SimHal::new(
        config.engines,
        config.te_data_size,
        config.lookup_size,
        config.counters,
    );
    TunnelState::new(config, hal).unwrap()
}

fn state(te_data_size: u32) -> TunnelState<SimHal> {
    state_with(config(te_data_size))
}

fn hash_group(size: u32) -> TunnelGroupParams {
    TunnelGroupParamsBuilder::default().size(size).build().unwrap()
}

fn direct_group(size: u32) -> TunnelGroupParams {
    TunnelGroupParamsBuilder::default()
        .size(size)
        .lookup(LookupType::Direct)
        .build()
        .unwrap()
}

fn encap_group() -> TunnelGroupParams {
    TunnelGroupParamsBuilder::default()
        .size(16)
        .encap(true)
        .build()
        .unwrap()
}

fn vni(vni: u32) -> ConditionParams {
    ConditionParams {
        vni,
        ..Default::default()
    }
}

fn dglort(dglort: u16) -> RuleActionParams {
    RuleActionParams {
        dglort,
        ..Default::default()
    }
}

fn add_direct(s: &mut TunnelState<SimHal>, group: GroupId, id: u32, action: RuleAction) {
    s.add_rule(
        group,
        id,
        TunnelCondition::empty(),
        &ConditionParams::default(),
        action,
        &dglort(0x100),
    )
    .unwrap();
}

fn flow_params(shared: bool, action: EncapField) -> EncapFlowParams {
    EncapFlowParams {
        shared,
        action,
        values: EncapValues {
            vni: 77,
            dip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            sip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2)),
            l4_dst: 4789,
            ..Default::default()
        },
    }
}

fn read_block(s: &mut TunnelState<SimHal>, block: BlockRef) -> Vec<TeRecord> {
    let mut words = vec![0u32; block.length as usize * TE_DATA_WIDTH];
    s.hal
        .read_block(&hal::TE_DATA, block.start, 0, &mut words)
        .unwrap();
    decode_block(&from_words(&words)).unwrap()
}

#[test]
fn group_placement() {
    let mut s = state(64);
    let a = s.create_group(&hash_group(10)).unwrap();
    let info = s.group_info(a).unwrap();
    assert_eq!(info.lookup_size, 16);
    assert_eq!(info.lookup_base, 0);
    assert_eq!((info.glort.base, info.glort.size), (0x2000, 1));

    assert_eq!(
        s.create_group(&TunnelGroupParamsBuilder::default().size(4).tep_size(0).build().unwrap()),
        Err(TunnelError::TepSize(0))
    );
    assert_eq!(
        s.create_group(&TunnelGroupParamsBuilder::default().size(4).tep_size(2000).build().unwrap()),
        Err(TunnelError::TepSize(2000))
    );
    assert_eq!(
        s.create_group(&hash_group(0)),
        Err(TunnelError::InvalidArgument("empty tunnel group"))
    );

    let params = TunnelGroupParamsBuilder::default()
        .size(5)
        .lookup(LookupType::Direct)
        .tep_size(3)
        .build()
        .unwrap();
    let b = s.create_group(&params).unwrap();
    let info = s.group_info(b).unwrap();
    // direct groups are not rounded
    assert_eq!((info.lookup_base, info.lookup_size), (16, 5));
    assert_eq!((info.glort.base, info.glort.size), (0x2004, 4));

    assert_eq!(s.create_group(&hash_group(4)), Err(TunnelError::GroupFull(0)));
    assert_eq!(
        s.group_after(None).map(|g| g.id),
        Some(a.min(b))
    );
    assert_eq!(s.group_after(Some(a.max(b))), None);

    s.delete_group(a).unwrap();
    assert_eq!(s.group_info(a), Err(TunnelError::NoSuchGroup(a)));
    // the freed lookup range is reused
    let c = s.create_group(&hash_group(8)).unwrap();
    assert_eq!(s.group_info(c).unwrap().lookup_base, 0);
}

#[test]
fn delete_group_in_use() {
    let mut s = state(64);
    let g = s.create_group(&direct_group(4)).unwrap();
    add_direct(&mut s, g, 0, RuleAction::SET_DGLORT);
    assert!(matches!(s.delete_group(g), Err(TunnelError::InUse(_))));
    s.delete_rule(g, 0).unwrap();
    s.delete_group(g).unwrap();
}

#[test]
fn direct_rules() {
    let mut s = state(64);
    let g = s.create_group(&direct_group(8)).unwrap();
    assert_eq!(s.next_free_direct_index(g), Ok(Some(0)));
    add_direct(&mut s, g, 0, RuleAction::SET_DGLORT);
    assert_eq!(s.next_free_direct_index(g), Ok(Some(1)));

    let rule = s.rule(g, 0).unwrap();
    assert_eq!(rule.data_pos, 1);
    let index = s.group(g).unwrap().lookup_index(0);
    assert_eq!(s.hal.get_lookup_entry(0, index), Ok(LookupEntry::new(1, 2)));

    let again = s.add_rule(
        g,
        0,
        TunnelCondition::empty(),
        &ConditionParams::default(),
        RuleAction::SET_DGLORT,
        &dglort(1),
    );
    assert!(matches!(again, Err(TunnelError::InvalidEntry(_))));
    let beyond = s.add_rule(
        g,
        8,
        TunnelCondition::empty(),
        &ConditionParams::default(),
        RuleAction::SET_DGLORT,
        &dglort(1),
    );
    assert!(matches!(beyond, Err(TunnelError::InvalidEntry(_))));
    let encap = s.add_rule(
        g,
        3,
        TunnelCondition::empty(),
        &ConditionParams::default(),
        RuleAction::ENCAP_FLOW,
        &dglort(1),
    );
    assert!(matches!(encap, Err(TunnelError::TunnelConflict(_))));
    assert_eq!(s.group(g).unwrap().rules.len(), 1);

    s.delete_rule(g, 0).unwrap();
    assert_eq!(s.hal.get_lookup_entry(0, index), Ok(LookupEntry::invalid()));
    assert_eq!(s.delete_rule(g, 0), Err(TunnelError::NoSuchRule(g, 0)));
    assert_eq!(s.next_free_direct_index(g), Ok(Some(0)));
    s.validate(0).unwrap();
}

#[test]
fn hash_key_conflicts() {
    let mut s = state(64);
    let g = s.create_group(&hash_group(16)).unwrap();
    s.add_rule(g, 1, TunnelCondition::VNI, &vni(100), RuleAction::SET_DGLORT, &dglort(1))
        .unwrap();
    let dup = s.add_rule(g, 2, TunnelCondition::VNI, &vni(100), RuleAction::SET_DGLORT, &dglort(2));
    assert!(matches!(dup, Err(TunnelError::TunnelConflict(_))));
    let empty = s.add_rule(
        g,
        3,
        TunnelCondition::empty(),
        &ConditionParams::default(),
        RuleAction::SET_DGLORT,
        &dglort(3),
    );
    assert!(matches!(empty, Err(TunnelError::InvalidArgument(_))));
    assert_eq!(s.group(g).unwrap().rules.len(), 1);
    assert!(matches!(
        s.next_free_direct_index(g),
        Err(TunnelError::InvalidArgument(_))
    ));
    // a rule may keep its own key on update
    s.update_rule(g, 1, TunnelCondition::VNI, &vni(100), RuleAction::SET_DGLORT, &dglort(9))
        .unwrap();
    s.validate(0).unwrap();
}

#[test]
fn bin_length_limit() {
    let mut config = config(64);
    config.max_block_length = 4;
    let mut s = state_with(config);
    let g = s.create_group(&hash_group(1)).unwrap();
    s.add_rule(g, 1, TunnelCondition::VNI, &vni(1), RuleAction::SET_DGLORT, &dglort(1))
        .unwrap();
    assert_eq!(
        s.add_rule(g, 2, TunnelCondition::VNI, &vni(2), RuleAction::SET_DGLORT, &dglort(2)),
        Err(TunnelError::BinFull { bin: 0, max: 4 })
    );
    assert_eq!(s.group(g).unwrap().bins[&0].rules.len(), 1);
}

#[test]
fn counters() {
    let mut s = state(64);
    let g = s.create_group(&direct_group(8)).unwrap();
    add_direct(&mut s, g, 0, RuleAction::SET_DGLORT | RuleAction::COUNTER);
    let counter = s.rule(g, 0).unwrap().counter.unwrap();
    s.hal.count_traffic(0, counter, 100);
    assert_eq!(
        s.rule_counter(g, 0),
        Ok(FlowCounter {
            packets: 1,
            bytes: 100
        })
    );
    s.reset_rule_counter(g, 0).unwrap();
    assert_eq!(s.rule_counter(g, 0), Ok(FlowCounter::default()));
    assert_eq!(s.usage(g).unwrap().count.used, 1);
    assert_eq!(s.usage(g).unwrap().count.available, 3);

    s.update_rule(
        g,
        0,
        TunnelCondition::empty(),
        &ConditionParams::default(),
        RuleAction::SET_DGLORT,
        &dglort(2),
    )
    .unwrap();
    assert_eq!(s.rule(g, 0).unwrap().counter, None);
    assert!(matches!(s.rule_counter(g, 0), Err(TunnelError::InvalidArgument(_))));
    let usage = s.usage(g).unwrap();
    assert_eq!((usage.count.used, usage.count.available, usage.count.total), (0, 4, 4));

    for id in 0..4 {
        if id > 0 {
            add_direct(&mut s, g, id, RuleAction::SET_DGLORT | RuleAction::COUNTER);
        } else {
            s.update_rule(
                g,
                0,
                TunnelCondition::empty(),
                &ConditionParams::default(),
                RuleAction::SET_DGLORT | RuleAction::COUNTER,
                &dglort(2),
            )
            .unwrap();
        }
    }
    let full = s.add_rule(
        g,
        4,
        TunnelCondition::empty(),
        &ConditionParams::default(),
        RuleAction::SET_DGLORT | RuleAction::COUNTER,
        &dglort(4),
    );
    assert_eq!(full, Err(TunnelError::CountFull(0)));
    assert_eq!(s.group(g).unwrap().rules.len(), 4);
    assert_eq!(s.next_free_direct_index(g), Ok(Some(4)));
}

#[traced_test]
#[test]
fn counter_release_is_checked() {
    let mut s = state(64);
    let counter = s.reserve_counter(0).unwrap();
    assert_eq!(s.engine(0).unwrap().counters.available(), 3);
    s.release_counter(0, counter);
    assert_eq!(s.engine(0).unwrap().counters.available(), 4);
    assert!(logs_contain("engine 0: released counter"));
    assert!(!logs_contain("was not reserved"));

    s.release_counter(0, counter);
    assert_eq!(s.engine(0).unwrap().counters.available(), 4);
    assert!(logs_contain("was not reserved"));
    s.release_counter(7, 0);
}

#[test]
fn used_bits() {
    let mut s = state(64);
    let g = s.create_group(&direct_group(8)).unwrap();
    add_direct(&mut s, g, 2, RuleAction::SET_DGLORT);
    let pos = s.rule(g, 2).unwrap().data_pos;
    assert_eq!(s.rule_used(g, 2), Ok(false));
    s.hal.hit(0, pos);
    assert_eq!(s.rule_used(g, 2), Ok(true));
    s.reset_rule_used(g, 2).unwrap();
    assert_eq!(s.rule_used(g, 2), Ok(false));

    // new content starts unused
    s.hal.hit(0, pos);
    s.update_rule(
        g,
        2,
        TunnelCondition::empty(),
        &ConditionParams::default(),
        RuleAction::SET_DGLORT | RuleAction::SET_SGLORT,
        &dglort(3),
    )
    .unwrap();
    assert_ne!(s.rule(g, 2).unwrap().data_pos, pos);
    assert_eq!(s.rule_used(g, 2), Ok(false));

    let h = s.create_group(&hash_group(4)).unwrap();
    s.add_rule(h, 1, TunnelCondition::VNI, &vni(5), RuleAction::SET_DGLORT, &dglort(1))
        .unwrap();
    assert!(matches!(s.rule_used(h, 1), Err(TunnelError::InvalidArgument(_))));
}

#[test]
fn flow_full_changes_nothing() {
    // 10 usable slots, 2 of which are headroom
    let mut s = state(19);
    let g = s.create_group(&direct_group(16)).unwrap();
    for id in 0..4 {
        add_direct(&mut s, g, id, RuleAction::SET_DGLORT);
    }
    let free = s.engine(0).unwrap().tedata.free_count();
    s.hal.clear_journal();
    let full = s.add_rule(
        g,
        4,
        TunnelCondition::empty(),
        &ConditionParams::default(),
        RuleAction::SET_DGLORT,
        &dglort(4),
    );
    assert_eq!(full, Err(TunnelError::FlowFull));
    assert!(full.unwrap_err().is_clean());
    assert!(s.hal.journal().is_empty());
    assert_eq!(s.engine(0).unwrap().tedata.free_count(), free);
    assert_eq!(s.group(g).unwrap().rules.len(), 4);
    assert_eq!(s.group(g).unwrap().bins.len(), 4);
    assert_eq!(s.next_free_direct_index(g), Ok(Some(4)));
    s.validate(0).unwrap();
}

#[traced_test]
#[test]
fn hardware_failure_is_internal() {
    let mut s = state(64);
    let g = s.create_group(&direct_group(8)).unwrap();
    s.hal.fail_writes_after(0);
    let err = s
        .add_rule(
            g,
            0,
            TunnelCondition::empty(),
            &ConditionParams::default(),
            RuleAction::SET_DGLORT,
            &dglort(1),
        )
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Internal);
    assert!(!err.is_clean());
    assert!(logs_contain("diverged"));
}

#[test]
fn encap_flows_need_encap_groups() {
    let mut s = state(64);
    let d = s.create_group(&hash_group(4)).unwrap();
    let params = flow_params(true, EncapField::VNI | EncapField::DIP);
    assert!(matches!(
        s.add_encap_flow(d, 1, &params),
        Err(TunnelError::TunnelConflict(_))
    ));
    let e = s.create_group(&encap_group()).unwrap();
    assert!(matches!(
        s.add_encap_flow(e, 1, &flow_params(true, EncapField::VNI)),
        Err(TunnelError::InvalidArgument(_))
    ));
    s.add_encap_flow(e, 1, &params).unwrap();
    assert!(matches!(
        s.add_encap_flow(e, 1, &params),
        Err(TunnelError::InvalidEntry(_))
    ));
    assert!(matches!(
        s.update_encap_flow(e, 1, &flow_params(false, EncapField::VNI | EncapField::DIP)),
        Err(TunnelError::InvalidArgument(_))
    ));
    assert_eq!(
        s.update_encap_flow(e, 2, &params),
        Err(TunnelError::NoEncapFlow(2))
    );
    let missing = s.add_rule(
        e,
        1,
        TunnelCondition::VNI,
        &vni(3),
        RuleAction::ENCAP_FLOW,
        &RuleActionParams {
            encap_flow: 9,
            ..Default::default()
        },
    );
    assert_eq!(missing, Err(TunnelError::NoEncapFlow(9)));
}

#[test]
fn shared_flow_update_repoints_rules() {
    let mut s = state(64);
    let e = s.create_group(&encap_group()).unwrap();
    let action = EncapField::VNI | EncapField::DIP | EncapField::SIP;
    s.add_encap_flow(e, 1, &flow_params(true, action)).unwrap();
    let first = s.flow(e, 1).unwrap().block.unwrap();
    s.add_rule(
        e,
        10,
        TunnelCondition::VNI,
        &vni(3),
        RuleAction::ENCAP_FLOW | RuleAction::SET_VNI,
        &RuleActionParams {
            encap_flow: 1,
            vni: 4000,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(s.flow(e, 1).unwrap().rules.len(), 1);

    s.update_encap_flow(e, 1, &flow_params(true, action | EncapField::L4DST))
        .unwrap();
    let flow = s.flow(e, 1).unwrap();
    let second = flow.block.unwrap();
    assert_ne!(second.start, first.start);
    assert_eq!(second.length, first.length + 1);
    assert!(flow.retired.is_empty());

    let bin = s.rule(e, 10).unwrap().lookup_bin;
    let block = s.group(e).unwrap().bins[&bin].block.unwrap();
    let records = read_block(&mut s, block);
    let TeRecord::Encap(encap) = &records[1] else {
        panic!("no encap record in {records:?}");
    };
    assert_eq!(encap.fields, EncapField::VNI | EncapField::FLOW_PTR);
    assert_eq!(encap.values.vni, 4000);
    assert_eq!(encap.values.flow_ptr, FlowPtr::from(second));
    assert!(s.engine(0).unwrap().tedata.is_free(first.start));
    s.validate(0).unwrap();

    assert!(matches!(
        s.delete_encap_flow(e, 1),
        Err(TunnelError::InUse(_))
    ));
    s.delete_rule(e, 10).unwrap();
    s.delete_encap_flow(e, 1).unwrap();
    let tedata = &s.engine(0).unwrap().tedata;
    assert_eq!(tedata.free_count(), tedata.capacity());
}

#[traced_test]
#[test]
fn failed_shared_flow_update_keeps_old_block_until_released() {
    let mut s = state(64);
    let e = s.create_group(&encap_group()).unwrap();
    let action = EncapField::VNI | EncapField::DIP;
    s.add_encap_flow(e, 1, &flow_params(true, action)).unwrap();
    let first = s.flow(e, 1).unwrap().block.unwrap();
    s.add_rule(
        e,
        10,
        TunnelCondition::VNI,
        &vni(3),
        RuleAction::ENCAP_FLOW,
        &RuleActionParams {
            encap_flow: 1,
            ..Default::default()
        },
    )
    .unwrap();

    // the new flow block is written, rewriting the rule bin fails
    s.hal.fail_writes_after(1);
    let err = s
        .update_encap_flow(e, 1, &flow_params(true, action | EncapField::SIP))
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Internal);
    let flow = s.flow(e, 1).unwrap();
    assert_eq!(flow.retired, vec![first]);
    assert!(!s.engine(0).unwrap().tedata.is_free(first.start));
    assert!(logs_contain("retired blocks still in use"));

    s.hal.clear_failures();
    s.update_encap_flow(e, 1, &flow_params(true, action)).unwrap();
    let flow = s.flow(e, 1).unwrap();
    let third = flow.block.unwrap();
    assert!(flow.retired.is_empty());
    assert_ne!(third.start, first.start);
    assert!(s.engine(0).unwrap().tedata.is_free(first.start));

    let bin = s.rule(e, 10).unwrap().lookup_bin;
    let block = s.group(e).unwrap().bins[&bin].block.unwrap();
    let records = read_block(&mut s, block);
    let TeRecord::Encap(encap) = &records[1] else {
        panic!("no encap record in {records:?}");
    };
    assert_eq!(encap.values.flow_ptr, FlowPtr::from(third));
}

#[traced_test]
#[test]
fn validate_checks_flow_pointers() {
    let mut s = state(64);
    let e = s.create_group(&encap_group()).unwrap();
    s.add_encap_flow(e, 1, &flow_params(true, EncapField::VNI | EncapField::DIP))
        .unwrap();
    s.add_rule(
        e,
        10,
        TunnelCondition::VNI,
        &vni(3),
        RuleAction::ENCAP_FLOW,
        &RuleActionParams {
            encap_flow: 1,
            ..Default::default()
        },
    )
    .unwrap();
    s.validate(0).unwrap();

    let bin = s.rule(e, 10).unwrap().lookup_bin;
    let lookup_bin = &s.group(e).unwrap().bins[&bin];
    let block = lookup_bin.block.unwrap();
    let (_, offset) = lookup_bin.flow_ptrs[0];
    let stale = flow_ptr_slot(FlowPtr::from(BlockRef::new(40, 3)));
    s.hal
        .write_block(
            &hal::TE_DATA,
            block.start + offset,
            0,
            &to_words(&[stale]),
            hal::WriteMode::Confirmed,
        )
        .unwrap();
    let err = s.validate(0).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Internal);
    assert!(err.to_string().contains("not the block of encap flow 1"));
}

#[test]
fn unshared_flow_update_reencodes_rules() {
    let mut s = state(64);
    let e = s.create_group(&encap_group()).unwrap();
    let action = EncapField::VNI | EncapField::DIP | EncapField::SIP;
    s.add_encap_flow(e, 1, &flow_params(false, action)).unwrap();
    assert_eq!(s.flow(e, 1).unwrap().block, None);
    for id in [1, 2] {
        s.add_rule(
            e,
            id,
            TunnelCondition::VNI,
            &vni(id),
            RuleAction::ENCAP_FLOW,
            &RuleActionParams {
                encap_flow: 1,
                ..Default::default()
            },
        )
        .unwrap();
    }
    let mut params = flow_params(false, action);
    params.values.vni = 88;
    s.hal.clear_journal();
    s.update_encap_flow(e, 1, &params).unwrap();
    assert!(
        s.hal
            .journal()
            .iter()
            .any(|op| matches!(op, HalOp::SyncLookup { engine: 0 }))
    );
    for id in [1, 2] {
        let bin = s.rule(e, id).unwrap().lookup_bin;
        let block = s.group(e).unwrap().bins[&bin].block.unwrap();
        let records = read_block(&mut s, block);
        assert!(records.iter().any(|r| matches!(r, TeRecord::Encap(encap) if encap.values.vni == 88)));
    }
    s.validate(0).unwrap();
}

#[test]
fn teardown_removes_everything() {
    let mut s = state(64);
    let d = s.create_group(&direct_group(4)).unwrap();
    add_direct(&mut s, d, 1, RuleAction::SET_DGLORT | RuleAction::COUNTER);
    let e = s.create_group(&encap_group()).unwrap();
    s.add_encap_flow(e, 1, &flow_params(true, EncapField::DIP | EncapField::COUNTER))
        .unwrap();
    s.add_rule(
        e,
        1,
        TunnelCondition::VNI,
        &vni(1),
        RuleAction::ENCAP_FLOW,
        &RuleActionParams {
            encap_flow: 1,
            ..Default::default()
        },
    )
    .unwrap();

    s.teardown().unwrap();
    assert!(s.groups.is_empty());
    let engine = s.engine(0).unwrap();
    assert_eq!(engine.tedata.free_count(), engine.tedata.capacity());
    assert_eq!(engine.counters.available(), 4);
    let sim = s.hal.engine(0).unwrap();
    assert!(sim.lookup.iter().all(|entry| !entry.is_valid()));
}
