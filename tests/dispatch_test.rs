//! End-to-end dispatch tests: realistic reply traffic through a fully
//! built model, covering the guarantees callers rely on — deterministic
//! observer delivery, at-most-once terminal callbacks, and failure
//! isolation between keywords on one line.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use keyhub::{
    spawn, Arity, BoolTokens, CallType, CmdState, CmdVar, Converter, Dispatcher, Field,
    KeyVarFactory,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A filter-wheel model resembling a real instrument: one wide status
/// keyword, one numeric status block, and a free-text name.
struct FilterWheelModel {
    dispatcher: Dispatcher,
    curr_filter: keyhub::KeyVar,
    fw_status: keyhub::KeyVar,
    filter_name: keyhub::KeyVar,
}

impl FilterWheelModel {
    fn new() -> Self {
        let mut dispatcher = Dispatcher::new("client");
        let mut factory = KeyVarFactory::new(&mut dispatcher, "agile");

        // slot, name, slide in/out, note, temperature
        let curr_filter = factory
            .keyvar(
                "currFilter",
                Arity::Exactly(5),
                vec![
                    Converter::int_or_none(),
                    Converter::Str,
                    Converter::Bool(BoolTokens::new(&["In"], &["Out"])),
                    Converter::Str,
                    Converter::float_or_none(),
                ],
            )
            .unwrap();
        let fw_status = factory
            .keyvar(
                "fwStatus",
                Arity::Exactly(4),
                vec![
                    Converter::int_or_none_invalid(&[-1]),
                    Converter::int_or_none_invalid(&[-1]),
                    Converter::int_or_none(),
                    Converter::float_or_none(),
                ],
            )
            .unwrap();
        let filter_name = factory.string_keyvar("filterName").unwrap();
        factory.set_keys_refresh_cmd("getstatus");

        Self {
            dispatcher,
            curr_filter,
            fw_status,
            filter_name,
        }
    }
}

#[test]
fn filter_wheel_tuple_converts_heterogeneous_fields() {
    init_logging();
    let mut model = FilterWheelModel::new();

    model
        .dispatcher
        .process_line("client 11 agile i currFilter=2, \"MK_J\", Out, \"\", 21.0");

    let (value, is_current) = model.curr_filter.get();
    assert!(is_current);
    assert_eq!(
        value,
        vec![
            Field::Int(2),
            Field::Str("MK_J".to_string()),
            Field::Bool(false),
            Field::Str(String::new()),
            Field::Float(21.0),
        ]
    );
}

#[test]
fn unknown_sentinels_read_as_null() {
    init_logging();
    let mut model = FilterWheelModel::new();

    model
        .dispatcher
        .process_line("client 11 agile i fwStatus=-1, -1, ?, NaN");

    let (value, is_current) = model.fw_status.get();
    assert!(is_current);
    assert_eq!(value, vec![Field::None; 4]);
}

#[test]
fn done_reply_completes_command_and_later_replies_are_stale() {
    init_logging();
    let mut model = FilterWheelModel::new();

    let cmd = CmdVar::new("agile", "home filter");
    let finishes = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&finishes);
    cmd.on_finish(move |_| {
        *sink.lock().unwrap() += 1;
        Ok(())
    });

    model.dispatcher.start_cmd(&cmd, 5).unwrap();
    model.dispatcher.process_line("client 5 agile : ");
    assert_eq!(cmd.state(), CmdState::Done);

    // A trailing reply with the same id matches nothing.
    model.dispatcher.process_line("client 5 agile f filterJam");
    assert_eq!(cmd.state(), CmdState::Done);
    assert_eq!(*finishes.lock().unwrap(), 1);
}

#[test]
fn timeout_fails_command_exactly_once() {
    init_logging();
    let mut model = FilterWheelModel::new();

    let cmd = CmdVar::new("agile", "move 3").with_timeout(Duration::from_secs(2));
    let fails = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&fails);
    cmd.add_callback(&[CallType::Fail], move |notice| {
        assert!(notice.detail.contains("timed out"));
        *sink.lock().unwrap() += 1;
        Ok(())
    });

    let start = Instant::now();
    model.dispatcher.start_cmd(&cmd, 7).unwrap();

    model.dispatcher.check_timeouts(start + Duration::from_secs(1));
    assert_eq!(cmd.state(), CmdState::Running);

    model.dispatcher.check_timeouts(start + Duration::from_secs(3));
    assert_eq!(cmd.state(), CmdState::Failed);

    // Further sweeps and late replies change nothing.
    model.dispatcher.check_timeouts(start + Duration::from_secs(9));
    model.dispatcher.process_line("client 7 agile : ");
    assert_eq!(cmd.state(), CmdState::Failed);
    assert_eq!(*fails.lock().unwrap(), 1);
}

#[test]
fn unterminated_quote_spares_sibling_groups() {
    init_logging();
    let mut model = FilterWheelModel::new();

    model
        .dispatcher
        .process_line("client 0 agile i filterName=\"oops; fwStatus=0, 1, 2, 3.5");

    // The damaged group left filterName untouched...
    assert!(!model.filter_name.has_value());
    // ...while the recovered group on the same line landed.
    let (value, is_current) = model.fw_status.get();
    assert!(is_current);
    assert_eq!(
        value,
        vec![
            Field::Int(0),
            Field::Int(1),
            Field::Int(2),
            Field::Float(3.5),
        ]
    );
}

#[test]
fn conversion_error_on_one_keyword_spares_the_other() {
    init_logging();
    let mut model = FilterWheelModel::new();

    // fwStatus has too few fields; filterName on the same line is fine.
    model
        .dispatcher
        .process_line("client 0 agile i fwStatus=1, 2; filterName=\"MK_J\"");

    assert!(!model.fw_status.is_current());
    assert_eq!(
        model.filter_name.get(),
        (vec![Field::Str("MK_J".to_string())], true)
    );
}

#[test]
fn observer_sequences_are_deterministic() {
    init_logging();
    let lines = [
        "client 0 agile i filterName=\"MK_J\"",
        "client 0 agile i fwStatus=0, 1, 2, 3.5; filterName=\"MK_H\"",
        "client 0 agile w filterName=?",
        "client 0 agile i fwStatus=-1, -1, ?, NaN",
    ];

    let run = || {
        let model = FilterWheelModel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kv in [&model.filter_name, &model.fw_status] {
            let sink = Arc::clone(&seen);
            let keyword = kv.keyword().to_string();
            kv.add_observer(
                move |value, is_current| {
                    sink.lock().unwrap().push((keyword.clone(), value.to_vec(), is_current));
                    Ok(())
                },
                false,
            );
        }
        let mut model = model;
        keyhub::testfeed::dispatch(&mut model.dispatcher, &lines);
        let recorded = seen.lock().unwrap().clone();
        recorded
    };

    assert_eq!(run(), run());
}

#[test]
fn observers_fire_in_registration_order() {
    init_logging();
    let mut model = FilterWheelModel::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for tag in ["O1", "O2"] {
        let sink = Arc::clone(&order);
        model.filter_name.add_observer(
            move |_, _| {
                sink.lock().unwrap().push(tag);
                Ok(())
            },
            false,
        );
    }

    model
        .dispatcher
        .process_line("client 0 agile i filterName=\"MK_J\"");
    assert_eq!(order.lock().unwrap().as_slice(), &["O1", "O2"]);
}

#[test]
fn call_now_registration_matches_get() {
    init_logging();
    let mut model = FilterWheelModel::new();
    model
        .dispatcher
        .process_line("client 0 agile i filterName=\"MK_J\"");

    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    model.filter_name.add_observer(
        move |value, is_current| {
            *sink.lock().unwrap() = Some((value.to_vec(), is_current));
            Ok(())
        },
        true,
    );

    let delivered = seen.lock().unwrap().clone().unwrap();
    assert_eq!(delivered, model.filter_name.get());
}

#[tokio::test]
async fn actor_animates_a_data_set_end_to_end() {
    init_logging();
    let model = FilterWheelModel::new();
    let filter_name = model.filter_name.clone();
    let (handle, join) = spawn(model.dispatcher);

    handle.set_connected(true).await.unwrap();

    let groups = vec![
        vec!["client 0 agile i filterName=\"MK_J\"".to_string()],
        vec!["client 0 agile i filterName=\"MK_H\"".to_string()],
    ];
    keyhub::testfeed::run_data_set(&handle, &groups, Duration::from_millis(10))
        .await
        .unwrap();

    let cmd = CmdVar::new("agile", "move 2");
    let id = handle.start_cmd(cmd.clone()).await.unwrap();
    handle
        .process_lines(vec![
            format!("client {id} agile i currFilter=2, \"MK_H\", In, \"\", 21.0"),
            format!("client {id} agile : "),
        ])
        .await
        .unwrap();

    handle.shutdown().await.unwrap();
    join.await.unwrap();

    assert_eq!(cmd.state(), CmdState::Done);
    assert_eq!(
        filter_name.get(),
        (vec![Field::Str("MK_H".to_string())], true)
    );
}
