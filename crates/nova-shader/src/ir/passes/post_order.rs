use crate::ir::{BlockId, Program};

/// Post order of the blocks reachable from the entry block (the first block in syntax order).
pub fn post_order(program: &Program) -> Vec<BlockId> {
    let Some(&entry) = program.block_order.first() else {
        return Vec::new();
    };
    let mut visited = vec![false; program.blocks.len()];
    let mut order = Vec::with_capacity(program.blocks.len());
    // (block, index of the next successor to visit)
    let mut stack = vec![(entry, 0usize)];
    visited[entry.index()] = true;
    while let Some((block, next)) = stack.last_mut() {
        let successors = &program.block(*block).imm_successors;
        if let Some(&successor) = successors.get(*next) {
            *next += 1;
            if !visited[successor.index()] {
                visited[successor.index()] = true;
                stack.push((successor, 0));
            }
        } else {
            order.push(*block);
            stack.pop();
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Stage;

    #[test]
    fn diamond_post_order_ends_with_entry() {
        let mut program = Program::new(Stage::Fragment);
        let entry = program.new_block();
        let left = program.new_block();
        let right = program.new_block();
        let merge = program.new_block();
        program.add_branch(entry, left);
        program.add_branch(entry, right);
        program.add_branch(left, merge);
        program.add_branch(right, merge);
        program.block_order = vec![entry, left, right, merge];

        let order = post_order(&program);
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], merge);
        assert_eq!(order[3], entry);
    }
}
