#[test]
fn demo_game_runs_without_a_window() {
    vesta::app::headless::run(5).unwrap();
}
