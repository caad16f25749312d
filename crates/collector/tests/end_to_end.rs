//! Agent and collector wired together over the in-process channel.

use std::sync::Arc;

use agent::session::{FLAG_BATCH_ENTER, FLAG_ENTER_EXIT, SessionHandle};
use agent::{Agent, EntryFrame, RpcConfig};
use collector::CollectorService;
use trace::header::TraceFileHeader;
use trace::record::Record;
use trace::segment::TraceFileReader;

fn agent_for(service: &Arc<CollectorService>) -> Agent {
    let channel: Arc<dyn agent::CollectorChannel> = service.clone();
    Agent::new(channel, &RpcConfig::from_values("target.dll", None, None))
}

fn call(agent: &Agent, state: &mut agent::ThreadState, i: u32) -> EntryFrame {
    let mut frame = EntryFrame {
        function: 0x2000 + i,
        return_address: 0x1000 + i,
        frame_ptr: 0x9000 - i * 0x20,
    };
    agent.on_enter(state, &mut frame).unwrap();
    frame
}

#[test]
fn batched_session_produces_one_batch_enter_record() {
    let service = Arc::new(CollectorService::new(4096, FLAG_BATCH_ENTER));
    let agent = agent_for(&service);
    let mut state = agent.new_thread_state(11);
    for i in 0..3 {
        call(&agent, &mut state, i);
    }
    agent.on_process_detach(&mut state).unwrap();

    let bytes = service
        .take_trace(SessionHandle(1), &TraceFileHeader::default())
        .unwrap();
    let reader = TraceFileReader::parse(&bytes).unwrap();
    let (segment_header, records) = reader.segments().next().unwrap();
    assert_eq!(segment_header.thread_id, 11);

    let records: Vec<Record> = records
        .map(|(prefix, payload)| Record::decode(&prefix, payload).unwrap())
        .collect();
    let batches: Vec<_> = records
        .iter()
        .filter_map(|r| match r {
            Record::BatchEnter { thread_id, calls } => Some((*thread_id, calls.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(batches.len(), 1);
    let (thread_id, calls) = &batches[0];
    assert_eq!(*thread_id, 11);
    assert_eq!(
        calls,
        &vec![(0x1000, 0x2000), (0x1001, 0x2001), (0x1002, 0x2002)]
    );
    // The detach also landed in the file.
    assert!(records.iter().any(|r| matches!(r, Record::ProcessDetach)));
}

#[test]
fn enter_exit_session_pairs_up() {
    let service = Arc::new(CollectorService::new(4096, FLAG_ENTER_EXIT));
    let agent = agent_for(&service);
    let mut state = agent.new_thread_state(4);

    let frame = call(&agent, &mut state, 0);
    // The swizzled address resolves back to the original.
    assert_eq!(
        agent
            .page_registry()
            .resolve_return_address(frame.return_address),
        Some(0x1000)
    );
    let resumed = agent.on_exit(&mut state, 0x8f00).unwrap();
    assert_eq!(resumed, 0x1000);
    agent.on_process_detach(&mut state).unwrap();

    let bytes = service
        .take_trace(SessionHandle(1), &TraceFileHeader::default())
        .unwrap();
    let reader = TraceFileReader::parse(&bytes).unwrap();
    let (_, records) = reader.segments().next().unwrap();
    let records: Vec<Record> = records
        .map(|(prefix, payload)| Record::decode(&prefix, payload).unwrap())
        .collect();
    assert!(records.contains(&Record::Enter {
        return_address: 0x1000,
        function: 0x2000
    }));
    assert!(records.contains(&Record::Exit {
        return_address: 0x1000,
        function: 0x2000
    }));
}
