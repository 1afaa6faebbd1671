//! Adapter ordering and backpressure through a whole task

use bytes::Bytes;
use proptest::prelude::*;
use std::thread;
use std::time::{Duration, Instant};
use streamtask::error::TaskResult;
use streamtask::pipeline::FnPipeline;
use streamtask::protocol::{InboundItem, OutboundItem, ResponseHead};
use streamtask::task::{ReadMode, RequestContext, Task, TaskInput, TaskOutput, TaskStatus};
use streamtask::testing::{fast_config, test_connection_with, ScriptedPipeline};

/// Copies every input chunk to the output as it arrives
fn forwarding_pipeline(
    max_read: usize,
) -> FnPipeline<impl Fn(&mut RequestContext, &mut TaskInput, &mut TaskOutput) -> TaskResult<()>>
{
    FnPipeline::new(
        "forward",
        move |_: &mut RequestContext, input: &mut TaskInput, output: &mut TaskOutput| -> TaskResult<()> {
            output.set_response(ResponseHead::ok())?;
            loop {
                let chunk = input.read(max_read, ReadMode::Blocking)?;
                if chunk.end_of_stream {
                    return output.close(None);
                }
                output.write(chunk.data)?;
            }
        },
    )
}

fn unbounded_config() -> streamtask::StreamTaskConfig {
    let mut config = fast_config();
    config.session.input_capacity = 0;
    config.session.output_capacity = 0;
    config
}

proptest! {
    #[test]
    fn prop_chunks_arrive_in_order_with_bytes_conserved(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..24),
        max_read in 1usize..32,
    ) {
        let connection = test_connection_with(unbounded_config(), forwarding_pipeline(max_read));
        let input = connection.input_queue();
        let output = connection.output_queue();
        let mut task = Task::create(1, &connection, input.clone(), output.clone()).unwrap();

        for chunk in &chunks {
            input.try_push(1, InboundItem::Data(Bytes::from(chunk.clone()))).unwrap();
        }
        input.try_push(1, InboundItem::End).unwrap();

        prop_assert_eq!(task.execute().unwrap(), TaskStatus::Completed);

        let items: Vec<_> = std::iter::from_fn(|| output.try_pop(1)).collect();
        prop_assert_eq!(&items[0], &OutboundItem::Response(ResponseHead::ok()));
        prop_assert_eq!(items.last(), Some(&OutboundItem::End { trailers: None }));

        let mut received = Vec::new();
        for item in &items[1..items.len() - 1] {
            match item {
                OutboundItem::Data(data) => {
                    prop_assert!(!data.is_empty());
                    prop_assert!(data.len() <= max_read);
                    received.extend_from_slice(data);
                }
                other => prop_assert!(false, "unexpected item {:?}", other),
            }
        }
        prop_assert_eq!(received, chunks.concat());
    }
}

#[test]
fn test_full_output_blocks_writer_without_loss() {
    let mut config = fast_config();
    config.session.output_capacity = 1;

    let mut pipeline = ScriptedPipeline::new(200);
    for i in 0..20 {
        pipeline = pipeline.with_chunk(format!("{i:02}"));
    }
    let connection = test_connection_with(config, pipeline);
    let input = connection.input_queue();
    let output = connection.output_queue();
    let mut task = Task::create(3, &connection, input.clone(), output.clone()).unwrap();
    input.try_push(3, InboundItem::End).unwrap();

    let worker = thread::spawn(move || task.execute());

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut body = String::new();
    loop {
        assert!(Instant::now() < deadline, "response never ended");
        match output.pop_timeout(3, Duration::from_millis(50)) {
            Some(OutboundItem::Data(data)) => {
                assert!(output.len(3) <= 1, "queue bound exceeded");
                body.push_str(std::str::from_utf8(&data).unwrap());
                thread::sleep(Duration::from_millis(1));
            }
            Some(OutboundItem::End { .. }) => break,
            Some(_) | None => {}
        }
    }

    assert_eq!(worker.join().unwrap().unwrap(), TaskStatus::Completed);
    let expected: String = (0..20).map(|i| format!("{i:02}")).collect();
    assert_eq!(body, expected);
}

#[test]
fn test_read_timeout_fails_task() {
    let mut config = fast_config();
    config.task.read_timeout_ms = Some(20);
    let connection = test_connection_with(config, forwarding_pipeline(16));
    let mut task = Task::create(
        5,
        &connection,
        connection.input_queue(),
        connection.output_queue(),
    )
    .unwrap();

    match task.execute().unwrap() {
        TaskStatus::Failed { reason } => assert!(reason.contains("Timed out"), "{reason}"),
        other => panic!("unexpected status {other:?}"),
    }
}
