use std::rc::Rc;

use crate::ee::instructions::{InstrFlags, Instruction};
use crate::object::r#type::Type;

/// One instruction under construction, together with the bookkeeping the
/// rewriting stages need: where it came from in the on-disk body, the stack
/// state computed for it, and whether a peephole pass removed it.
struct BuilderEntry {
	original_offset: u32,
	original_size: u32,
	stack_height: Option<u16>,
	ref_signature: u32,
	removed: bool,
	instr: Instruction,
}

/// Accumulates decoded instructions and drives them through branch fix-up,
/// removal compaction and emission-offset assignment.
pub struct MethodBuilder {
	instructions: Vec<BuilderEntry>,
	has_branches: bool,
	types_to_initialize: Vec<Rc<Type>>,
	/// After `perform_removals`: old instruction index -> new index. One
	/// extra entry maps the end-of-body index.
	old_to_new: Vec<i32>,
	/// After `assign_offsets`: new instruction index -> emitted byte offset,
	/// plus one extra entry holding the total byte size.
	byte_offsets: Vec<u32>,
	original_size_total: u32,
}

impl MethodBuilder {
	pub fn new() -> Self {
		Self {
			instructions: Vec::new(),
			has_branches: false,
			types_to_initialize: Vec::new(),
			old_to_new: Vec::new(),
			byte_offsets: Vec::new(),
			original_size_total: 0,
		}
	}

	pub fn len(&self) -> usize {
		self.instructions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.instructions.is_empty()
	}

	pub fn append(&mut self, original_offset: u32, original_size: u32, instr: Instruction) {
		if instr.is_branch() || instr.is_switch() {
			self.has_branches = true;
		}
		self.original_size_total = original_offset + original_size;
		self.instructions.push(BuilderEntry {
			original_offset,
			original_size,
			stack_height: None,
			ref_signature: 0,
			removed: false,
			instr,
		});
	}

	pub fn has_branches(&self) -> bool {
		self.has_branches
	}

	pub fn instr(&self, index: usize) -> &Instruction {
		&self.instructions[index].instr
	}

	pub fn instr_mut(&mut self, index: usize) -> &mut Instruction {
		&mut self.instructions[index].instr
	}

	/// Replaces the instruction at `index`, keeping its origin bookkeeping.
	pub fn set_instruction(&mut self, index: usize, instr: Instruction) {
		self.instructions[index].instr = instr;
	}

	pub fn original_offset(&self, index: usize) -> u32 {
		self.instructions[index].original_offset
	}

	pub fn original_size(&self, index: usize) -> u32 {
		self.instructions[index].original_size
	}

	/// Translates a byte offset in the on-disk body to an instruction index.
	/// The end of the body is a valid target (the index one past the last
	/// instruction).
	pub fn find_index(&self, byte_offset: u32) -> Option<usize> {
		if byte_offset == self.original_size_total {
			return Some(self.instructions.len());
		}
		self.instructions
			.binary_search_by_key(&byte_offset, |e| e.original_offset)
			.ok()
	}

	pub fn stack_height(&self, index: usize) -> Option<u16> {
		self.instructions[index].stack_height
	}

	pub fn set_stack_height(&mut self, index: usize, height: u16) {
		self.instructions[index].stack_height = Some(height);
	}

	pub fn ref_signature(&self, index: usize) -> u32 {
		self.instructions[index].ref_signature
	}

	pub fn set_ref_signature(&mut self, index: usize, signature: u32) {
		self.instructions[index].ref_signature = signature;
	}

	pub fn add_branch(&mut self, index: usize) {
		self.instructions[index].instr.flags |= InstrFlags::HAS_BRANCHES;
	}

	pub fn mark_for_removal(&mut self, index: usize) {
		self.instructions[index].removed = true;
	}

	pub fn is_marked_for_removal(&self, index: usize) -> bool {
		self.instructions[index].removed
	}

	/// Queues `ty` for a static-constructor run, once.
	pub fn add_type_to_initialize(&mut self, ty: &Rc<Type>) {
		if !ty.needs_static_init() {
			return;
		}
		if self.types_to_initialize.iter().any(|t| Rc::ptr_eq(t, ty)) {
			return;
		}
		self.types_to_initialize.push(ty.clone());
	}

	pub fn take_types_to_initialize(&mut self) -> Vec<Rc<Type>> {
		std::mem::take(&mut self.types_to_initialize)
	}

	/// Compacts out removed instructions. Branch and switch targets (which
	/// hold pre-removal indices) are rewritten; the old-index map is kept for
	/// translating try regions and debug spans afterwards. Targets pointing
	/// at a removed instruction land on the next one kept.
	pub fn perform_removals(&mut self) {
		let old_len = self.instructions.len();
		self.old_to_new = Vec::with_capacity(old_len + 1);

		let mut new_index = 0i32;
		for entry in &self.instructions {
			self.old_to_new.push(new_index);
			if !entry.removed {
				new_index += 1;
			}
		}
		self.old_to_new.push(new_index);

		let old_to_new = std::mem::take(&mut self.old_to_new);
		self.instructions.retain(|e| !e.removed);
		for entry in &mut self.instructions {
			if let Some(target) = entry.instr.branch_target_mut() {
				*target = old_to_new[*target as usize];
			}
			if let Some(targets) = entry.instr.switch_targets_mut() {
				for target in targets.iter_mut() {
					*target = old_to_new[*target as usize];
				}
			}
		}
		self.old_to_new = old_to_new;
	}

	/// Assigns each remaining instruction its byte offset in the emitted
	/// body. Must run after `perform_removals`.
	pub fn assign_offsets(&mut self) {
		self.byte_offsets = Vec::with_capacity(self.instructions.len() + 1);
		let mut offset = 0u32;
		for entry in &self.instructions {
			self.byte_offsets.push(offset);
			offset += entry.instr.emitted_size() as u32;
		}
		self.byte_offsets.push(offset);
	}

	/// Total size of the emitted body.
	pub fn byte_size(&self) -> u32 {
		*self.byte_offsets.last().unwrap_or(&0)
	}

	/// Byte offset of a post-removal instruction index.
	pub fn offset_of_new_index(&self, new_index: i32) -> u32 {
		self.byte_offsets[new_index as usize]
	}

	/// Translates a pre-removal instruction index all the way to its emitted
	/// byte offset.
	pub fn new_offset(&self, old_index: u32) -> u32 {
		self.byte_offsets[self.old_to_new[old_index as usize] as usize]
	}
}

impl Default for MethodBuilder {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ee::instructions::InstrKind;

	fn builder_with(sizes: &[u32]) -> MethodBuilder {
		let mut builder = MethodBuilder::new();
		let mut offset = 0;
		for size in sizes {
			builder.append(offset, *size, Instruction::new(InstrKind::Nop));
			offset += size;
		}
		builder
	}

	#[test]
	fn find_index_maps_offsets_to_instructions() {
		let builder = builder_with(&[1, 3, 2]);
		assert_eq!(builder.find_index(0), Some(0));
		assert_eq!(builder.find_index(1), Some(1));
		assert_eq!(builder.find_index(4), Some(2));
		// End of body is a valid region boundary.
		assert_eq!(builder.find_index(6), Some(3));
		// Mid-instruction offsets do not resolve.
		assert_eq!(builder.find_index(2), None);
		assert_eq!(builder.find_index(9), None);
	}

	#[test]
	fn removals_remap_branch_targets() {
		let mut builder = MethodBuilder::new();
		builder.append(0, 2, Instruction::new(InstrKind::Branch { target: 2, is_leave: false }));
		builder.append(2, 1, Instruction::new(InstrKind::Nop));
		builder.append(3, 1, Instruction::new(InstrKind::Nop));
		builder.mark_for_removal(1);
		builder.perform_removals();

		assert_eq!(builder.len(), 2);
		assert_eq!(builder.instr(0).branch_target(), Some(1));
		// Old indices survive through the map, removed ones land on the next
		// kept instruction.
		builder.assign_offsets();
		assert_eq!(builder.new_offset(1), builder.new_offset(2));
	}
}
