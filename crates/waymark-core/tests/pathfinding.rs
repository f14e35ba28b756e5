//! A* and bug2 planning on fixed obstacle maps.

use std::collections::HashSet;

use waymark_core::geometry::{BlockPos, Position};
use waymark_core::sandbox::SandboxError;
use waymark_core::search::{bug2, pathfind, Bug2Options, Handedness, PathfindOptions};

fn wall_x3() -> HashSet<BlockPos> {
    (-2..=2).map(|z| BlockPos::new(3, 0, z)).collect()
}

// -------------------------------------------------------------------------
// A*
// -------------------------------------------------------------------------

#[test]
fn straight_path_on_open_ground() {
    let res = pathfind(
        BlockPos::new(0, 0, 0),
        BlockPos::new(3, 0, 0),
        |_| false,
        &PathfindOptions::default(),
    )
    .unwrap();

    assert_eq!(res.path.len(), 4);
    for (i, cell) in res.path.iter().enumerate() {
        assert_eq!(*cell, BlockPos::new(i as i32, 0, 0));
    }
    assert_eq!(res.cost, 3);
}

#[test]
fn equal_cost_routes_resolve_identically() {
    let obstacles: HashSet<BlockPos> = [
        BlockPos::new(2, 0, 0),
        BlockPos::new(2, 0, 1),
        BlockPos::new(4, 0, -1),
    ]
    .into_iter()
    .collect();
    let opts = PathfindOptions {
        allow_vertical: false,
        ..PathfindOptions::default()
    };
    let plan = || {
        pathfind(
            BlockPos::new(0, 0, 0),
            BlockPos::new(6, 0, 2),
            |c| obstacles.contains(&c),
            &opts,
        )
        .unwrap()
    };

    let first = plan();
    for _ in 0..10 {
        assert_eq!(plan(), first);
    }
    assert_eq!(first.cost, 8);
    assert!(first.path.iter().all(|c| !obstacles.contains(c)));
    assert!(first
        .path
        .windows(2)
        .all(|w| w[0].manhattan(w[1]) == 1));
}

#[test]
fn vertical_moves_used_only_when_allowed() {
    // A wall at x=1 spanning y=0 and every z nearby; open at y=1.
    let wall: HashSet<BlockPos> = (-3..=3).map(|z| BlockPos::new(1, 0, z)).collect();
    let start = BlockPos::new(0, 0, 0);
    let goal = BlockPos::new(2, 0, 0);

    let vertical = pathfind(start, goal, |c| wall.contains(&c), &PathfindOptions::default()).unwrap();
    assert!(vertical.path.iter().any(|c| c.y == 1));
    assert_eq!(vertical.cost, 4);

    let flat = PathfindOptions {
        allow_vertical: false,
        max_iterations: 500,
        ..PathfindOptions::default()
    };
    let detour = pathfind(start, goal, |c| wall.contains(&c), &flat).unwrap();
    assert!(detour.path.iter().all(|c| c.y == 0));
    assert!(detour.cost > vertical.cost);
}

#[test]
fn unreachable_goal_reports_path_not_found() {
    let goal = BlockPos::new(4, 0, 0);
    let opts = PathfindOptions {
        allow_vertical: false,
        max_iterations: 300,
        ..PathfindOptions::default()
    };
    let err = pathfind(
        BlockPos::new(0, 0, 0),
        goal,
        |c| c.manhattan(goal) == 1,
        &opts,
    )
    .unwrap_err();
    assert!(matches!(err, SandboxError::PathNotFound { .. }));
}

// -------------------------------------------------------------------------
// bug2
// -------------------------------------------------------------------------

#[test]
fn bug2_follows_wall_with_right_hand() {
    let wall = wall_x3();
    let res = bug2(
        Position::new(0.0, 0.0, 0.0),
        Position::new(6.0, 0.0, 0.0),
        |c| Ok(wall.contains(&c)),
        &Bug2Options::default(),
    )
    .unwrap();

    let expected = vec![
        BlockPos::new(0, 0, 0),
        BlockPos::new(2, 0, 0),
        BlockPos::new(2, 0, -3),
        BlockPos::new(4, 0, -3),
        BlockPos::new(4, 0, 0),
        BlockPos::new(6, 0, 0),
    ];
    assert_eq!(res.path, expected);
    assert_eq!(res.steps, 13);
}

#[test]
fn bug2_left_hand_goes_around_the_other_side() {
    let wall = wall_x3();
    let opts = Bug2Options {
        handedness: Handedness::Left,
        ..Bug2Options::default()
    };
    let res = bug2(
        Position::new(0.0, 0.0, 0.0),
        Position::new(6.0, 0.0, 0.0),
        |c| Ok(wall.contains(&c)),
        &opts,
    )
    .unwrap();
    assert!(res.path.iter().any(|c| c.z == 3));
    assert!(res.path.iter().all(|c| c.z >= 0));
    assert_eq!(res.path.last(), Some(&BlockPos::new(6, 0, 0)));
}

#[test]
fn bug2_plans_on_floored_cells() {
    let wall = wall_x3();
    let plan = |start: Position, goal: Position| {
        bug2(start, goal, |c| Ok(wall.contains(&c)), &Bug2Options::default()).unwrap()
    };
    let whole = plan(Position::new(0.0, 0.0, 0.0), Position::new(6.0, 0.0, 0.0));
    let fractional = plan(Position::new(0.5, 0.9, 0.5), Position::new(6.5, 0.2, 0.5));
    assert_eq!(whole.path, fractional.path);
}

#[test]
fn bug2_enclosed_goal_fails() {
    let goal = BlockPos::new(6, 0, 0);
    let res = bug2(
        Position::new(0.0, 0.0, 0.0),
        goal.to_position(),
        |c| Ok(c.manhattan(goal) == 1),
        &Bug2Options::default(),
    );
    assert!(matches!(res, Err(SandboxError::PathNotFound { .. })));
}

#[test]
fn bug2_respects_iteration_cap() {
    let opts = Bug2Options {
        max_iterations: 3,
        ..Bug2Options::default()
    };
    let res = bug2(
        Position::new(0.0, 0.0, 0.0),
        Position::new(50.0, 0.0, 0.0),
        |_| Ok(false),
        &opts,
    );
    assert!(matches!(
        res,
        Err(SandboxError::PathNotFound { iterations: 3, .. })
    ));
}

#[test]
fn bug2_single_obstacle_off_the_line_matches_astar_length() {
    let rock = BlockPos::new(7, 0, 0);
    let start = BlockPos::new(0, 0, 0);
    let goal = BlockPos::new(10, 0, 4);

    let astar = pathfind(start, goal, |c| c == rock, &PathfindOptions::default()).unwrap();
    let res = bug2(
        start.to_position(),
        goal.to_position(),
        |c| Ok(c == rock),
        &Bug2Options::default(),
    )
    .unwrap();

    assert_eq!(astar.cost, 14);
    assert_eq!(res.steps - 1, astar.cost as usize);
    assert_eq!(res.path.last(), Some(&goal));
}

#[test]
fn bug2_diagonal_goal_behind_a_wall() {
    let wall: HashSet<BlockPos> = (-3..=5).map(|z| BlockPos::new(5, 0, z)).collect();
    let goal = BlockPos::new(10, 0, 4);
    let res = bug2(
        Position::new(0.0, 0.0, 0.0),
        goal.to_position(),
        |c| Ok(wall.contains(&c)),
        &Bug2Options::default(),
    )
    .unwrap();

    assert_eq!(res.path.last(), Some(&goal));
    assert!(res.path.iter().all(|c| !wall.contains(c)));
    // Right hand on the wall: around the north end.
    assert!(res.path.contains(&BlockPos::new(4, 0, -4)));
    assert!(res.path.iter().all(|c| c.z <= 5));
}

#[test]
fn bug2_diagonal_goal_inside_a_closed_box_fails() {
    let goal = BlockPos::new(10, 0, 4);
    let res = bug2(
        Position::new(0.0, 0.0, 0.0),
        goal.to_position(),
        |c| Ok(c.chebyshev(goal) == 1),
        &Bug2Options::default(),
    );
    assert!(matches!(res, Err(SandboxError::PathNotFound { .. })));
}
