mod key_index_tests;
