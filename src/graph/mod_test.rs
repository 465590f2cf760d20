use anyhow::Result;

use crate::fixtures;
use crate::graph::CellGraph;
use crate::models::CellCollection;

#[test]
fn build_rewrites_zero_weights_and_keeps_cross_cell_lanes() -> Result<()> {
    let cells = CellCollection::new(vec![
        fixtures::cell(1, 5.0, &[(2, 2)]),
        fixtures::cell(2, 0.0, &[]),
        fixtures::cell(3, 3.0, &[]),
        fixtures::cell(4, 2.0, &[]),
    ])?;

    let graph = CellGraph::build(&cells);

    assert_eq!(graph.vertex_count(), 4, "expected 4 vertices, got {}", graph.vertex_count());
    assert_eq!(graph.edge_count(), 1, "expected 1 edge, got {}", graph.edge_count());
    let weights: Vec<_> = graph.vertices().filter_map(|vertex| graph.vertex_weight(vertex)).collect();
    assert_eq!(weights, vec![5, 1, 3, 2], "unexpected vertex weights {:?}", weights);
    let (v1, v2) = (graph.vertex_of(1).expect("vertex for cell 1"), graph.vertex_of(2).expect("vertex for cell 2"));
    assert_eq!(graph.edge_weight(v1, v2), Some(2), "expected edge weight 2, got {:?}", graph.edge_weight(v1, v2));
    assert_eq!(graph.edge_weight(v2, v1), Some(2), "expected symmetric edge weight 2, got {:?}", graph.edge_weight(v2, v1));

    Ok(())
}

#[test]
fn build_merges_both_directions_into_one_edge() -> Result<()> {
    let cells = CellCollection::new(vec![
        fixtures::cell(7, 10.0, &[(2, 9), (1, 9)]),
        fixtures::cell(9, 10.0, &[(3, 7)]),
    ])?;

    let graph = CellGraph::build(&cells);

    assert_eq!(graph.edge_count(), 1, "expected a single merged edge, got {}", graph.edge_count());
    let (a, b) = (graph.vertex_of(7).expect("vertex for cell 7"), graph.vertex_of(9).expect("vertex for cell 9"));
    assert_eq!(graph.edge_weight(a, b), Some(6), "expected merged weight 6, got {:?}", graph.edge_weight(a, b));
    Ok(())
}

#[test]
fn build_skips_self_loops_outside_cells_and_zero_lane_links() -> Result<()> {
    let cells = CellCollection::new(vec![
        fixtures::cell(1, 10.0, &[(4, 1), (2, 42)]),
        fixtures::cell(2, 10.0, &[(0, 3)]),
        fixtures::cell(3, 10.0, &[(0, 2)]),
    ])?;

    let graph = CellGraph::build(&cells);

    assert_eq!(graph.edge_count(), 0, "expected no edges, got {}", graph.edge_count());
    for vertex in graph.vertices() {
        assert!(graph.edge_weight(vertex, vertex).is_none(), "unexpected self loop on vertex {}", vertex);
    }
    Ok(())
}

#[test]
fn build_numbers_vertices_from_one_in_cell_order() -> Result<()> {
    let cells = CellCollection::new(vec![fixtures::cell(30, 1.0, &[]), fixtures::cell(10, 1.0, &[]), fixtures::cell(20, 1.0, &[])])?;

    let graph = CellGraph::build(&cells);

    let mapped: Vec<_> = graph.vertices().filter_map(|vertex| graph.cell_of(vertex)).collect();
    assert_eq!(mapped, vec![10, 20, 30], "unexpected vertex to cell mapping {:?}", mapped);
    assert!(graph.cell_of(0).is_none(), "vertex 0 must never map to a cell");
    assert!(graph.cell_of(4).is_none(), "vertex 4 must not exist");
    Ok(())
}

#[test]
fn build_on_restricted_cells_ignores_links_to_dropped_cells() -> Result<()> {
    let cells = fixtures::cell_row(5)?;

    let graph = CellGraph::build(&cells.restrict(&[1, 2, 4]));

    assert_eq!(graph.vertex_count(), 3, "expected 3 vertices, got {}", graph.vertex_count());
    assert_eq!(graph.edge_count(), 1, "expected only the 1-2 link to survive, got {}", graph.edge_count());
    Ok(())
}

#[test]
fn solver_input_reproduces_vertex_and_edge_counts() -> Result<()> {
    let cells = fixtures::cell_row(25)?;
    let graph = CellGraph::build(&cells);

    let input = graph.to_solver_input();

    let mut lines = input.lines();
    let header: Vec<usize> = lines
        .next()
        .expect("header line")
        .split_whitespace()
        .take(2)
        .map(|val| val.parse())
        .collect::<Result<_, _>>()?;
    let (mut vertices, mut pairs) = (0, 0);
    for line in lines {
        let tokens = line.split_whitespace().count();
        assert!(tokens % 2 == 1, "expected a weight followed by neighbour pairs, got {:?}", line);
        vertices += 1;
        pairs += (tokens - 1) / 2;
    }
    assert_eq!(header, vec![graph.vertex_count(), graph.edge_count()], "unexpected header {:?}", header);
    assert_eq!(vertices, graph.vertex_count(), "expected {} vertex lines, got {}", graph.vertex_count(), vertices);
    assert_eq!(pairs / 2, graph.edge_count(), "expected {} edges listed, got {}", graph.edge_count(), pairs / 2);
    Ok(())
}

#[test]
fn solver_input_lists_weights_and_neighbours() -> Result<()> {
    let cells = CellCollection::new(vec![fixtures::cell(1, 5.0, &[(2, 2)]), fixtures::cell(2, 0.0, &[]), fixtures::cell(3, 3.4, &[(1, 2)])])?;
    let graph = CellGraph::build(&cells);

    let input = graph.to_solver_input();

    assert_eq!(input, "3 2 011\n5 2 2\n1 1 2 3 1\n3 2 1\n", "unexpected solver input:\n{}", input);
    Ok(())
}
